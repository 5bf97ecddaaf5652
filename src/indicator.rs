use std::sync::Mutex;

use log::{info, warn};

use crate::alerting::Severity;

/// What the device's LEDs/sounds should currently express
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorMode {
    Idle,
    Listening,
    Thinking,
    /// Speaking with a 0.0..=1.0 level for mouth/LED animation
    Speaking { level: f32 },
    Error,
    Alert { severity: Severity },
    Lockdown,
}

/// Local visual/audio indicator. Implementations must not block.
pub trait Indicator: Send + Sync {
    fn set_mode(&self, mode: IndicatorMode);

    /// Blink/beep pattern scaled by severity.
    fn signal_alert(&self, severity: Severity) {
        self.set_mode(IndicatorMode::Alert { severity });
    }
}

/// Indicator that reports mode changes to the log; the headless default.
#[derive(Default)]
pub struct LogIndicator {
    current: Mutex<Option<IndicatorMode>>,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<IndicatorMode> {
        self.current.lock().ok().and_then(|m| *m)
    }
}

impl Indicator for LogIndicator {
    fn set_mode(&self, mode: IndicatorMode) {
        if let Ok(mut current) = self.current.lock() {
            if *current == Some(mode) {
                return;
            }
            *current = Some(mode);
        }
        match mode {
            IndicatorMode::Alert { severity } => warn!(
                "[indicator] alert {:?}: {} blinks, tone {} Hz",
                severity,
                severity.blink_count(),
                severity.tone_hz()
            ),
            IndicatorMode::Error | IndicatorMode::Lockdown => warn!("[indicator] {:?}", mode),
            _ => info!("[indicator] {:?}", mode),
        }
    }
}

/// Records every mode it is given; for tests.
#[derive(Default)]
pub struct RecordingIndicator {
    modes: Mutex<Vec<IndicatorMode>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modes(&self) -> Vec<IndicatorMode> {
        self.modes.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Indicator for RecordingIndicator {
    fn set_mode(&self, mode: IndicatorMode) {
        if let Ok(mut modes) = self.modes.lock() {
            modes.push(mode);
        }
    }
}
