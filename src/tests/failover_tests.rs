#[cfg(test)]
mod failover_tests {
    use crate::clock::ManualClock;
    use crate::failover::*;
    use crate::store::{DeviceState, FileStateStore, MemoryStateStore};
    use std::sync::Arc;
    use std::time::Duration;

    const PRIMARY: &str = "primary.example.com";
    const SECONDARY: &str = "backup.example.com";

    fn manager_with(hosts: HostConfiguration) -> (FailoverManager, Arc<ManualClock>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let state = Arc::new(DeviceState::init(Box::new(store.clone()), hosts).unwrap());
        let manager = FailoverManager::new(state, clock.clone(), FailoverPolicy::default());
        (manager, clock, store)
    }

    fn two_hosts() -> HostConfiguration {
        HostConfiguration::new(PRIMARY, Some(SECONDARY), 443)
    }

    #[test]
    fn test_primary_failures_trigger_failover_once() {
        let (manager, clock, store) = manager_with(two_hosts());
        let mut events = manager.subscribe();

        for _ in 0..2 {
            assert!(matches!(manager.report_failure(PRIMARY).unwrap(), FailureOutcome::Retry { .. }));
            clock.advance_millis(500);
        }
        let outcome = manager.report_failure(PRIMARY).unwrap();
        assert_eq!(outcome, FailureOutcome::Switched { to: SECONDARY.to_string() });

        let state = manager.snapshot().unwrap();
        assert_eq!(manager.active_host().unwrap(), ActiveHost::Secondary);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.backoff_level, 0);
        assert!(state.is_in_failover_mode);
        assert_eq!(state.total_failures, 3);
        assert_eq!(manager.current_endpoint().unwrap(), (SECONDARY.to_string(), 443));

        // The switch is committed to the store, not just held in memory
        let committed = store.snapshot().unwrap();
        assert_eq!(committed.failover.current_host_index, 1);

        let mut switches = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FailoverEvent::SwitchedHost { .. }) {
                switches += 1;
            }
        }
        assert_eq!(switches, 1);
    }

    #[test]
    fn test_late_report_for_previous_host_is_stale() {
        let (manager, _clock, _store) = manager_with(two_hosts());
        for _ in 0..3 {
            manager.report_failure(PRIMARY).unwrap();
        }
        // An overlapping attempt against the old host reports in after the switch
        assert_eq!(manager.report_failure(PRIMARY).unwrap(), FailureOutcome::Stale);
        assert_eq!(manager.snapshot().unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_secondary_failures_fall_back_to_primary() {
        let (manager, _clock, _store) = manager_with(two_hosts());
        for _ in 0..3 {
            manager.report_failure(PRIMARY).unwrap();
        }
        for _ in 0..2 {
            manager.report_failure(SECONDARY).unwrap();
        }
        let outcome = manager.report_failure(SECONDARY).unwrap();
        assert_eq!(outcome, FailureOutcome::Switched { to: PRIMARY.to_string() });
        assert_eq!(manager.active_host().unwrap(), ActiveHost::Primary);
        assert!(!manager.snapshot().unwrap().is_in_failover_mode);
    }

    #[test]
    fn test_without_secondary_only_throttles() {
        let (manager, _clock, _store) = manager_with(HostConfiguration::new(PRIMARY, None, 443));
        for _ in 0..10 {
            assert!(matches!(manager.report_failure(PRIMARY).unwrap(), FailureOutcome::Retry { .. }));
        }
        let state = manager.snapshot().unwrap();
        assert_eq!(manager.active_host().unwrap(), ActiveHost::Primary);
        assert_eq!(state.consecutive_failures, 10);
        assert_eq!(state.backoff_level, BackoffTable::default().max_level());
        assert_eq!(manager.next_retry_delay().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_success_resets_counters_from_any_state() {
        let (manager, _clock, _store) = manager_with(HostConfiguration::new(PRIMARY, None, 443));
        for _ in 0..5 {
            manager.report_failure(PRIMARY).unwrap();
        }
        let mut events = manager.subscribe();
        manager.report_success(PRIMARY).unwrap();

        let state = manager.snapshot().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.backoff_level, 0);
        assert_eq!(state.primary_successes, 1);
        assert_eq!(state.total_failures, 5);
        assert_eq!(
            events.try_recv().unwrap(),
            FailoverEvent::Recovered { host: PRIMARY.to_string() }
        );
    }

    #[test]
    fn test_retry_readiness_follows_backoff_delay() {
        let (manager, clock, _store) = manager_with(two_hosts());
        assert!(manager.is_ready_for_retry().unwrap());

        manager.report_failure(PRIMARY).unwrap();
        // Level 1 of the default table is 2s
        assert_eq!(manager.next_retry_delay().unwrap(), Duration::from_secs(2));
        assert!(!manager.is_ready_for_retry().unwrap());
        assert_eq!(manager.remaining_backoff().unwrap(), Duration::from_secs(2));

        clock.advance_millis(1_500);
        assert!(!manager.is_ready_for_retry().unwrap());
        assert_eq!(manager.remaining_backoff().unwrap(), Duration::from_millis(500));

        clock.advance_millis(500);
        assert!(manager.is_ready_for_retry().unwrap());
        assert_eq!(manager.remaining_backoff().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_clock_stepping_backwards_does_not_wedge_retries() {
        let (manager, clock, _store) = manager_with(two_hosts());
        manager.report_failure(PRIMARY).unwrap();
        clock.set_millis(1_000);
        assert!(manager.is_ready_for_retry().unwrap());
    }

    #[test]
    fn test_backoff_delay_is_monotonic_and_capped() {
        let table = BackoffTable::default();
        let mut previous = Duration::ZERO;
        for level in 0..20 {
            let delay = table.delay(level);
            assert!(delay >= previous);
            assert!(delay <= table.cap());
            previous = delay;
        }
        assert_eq!(table.cap(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_table_rejects_bad_tables() {
        assert_eq!(BackoffTable::new(&[]).unwrap_err(), FailoverConfigError::EmptyBackoff);
        assert_eq!(
            BackoffTable::new(&[1_000, 5_000, 1_000]).unwrap_err(),
            FailoverConfigError::DecreasingBackoff { index: 2 }
        );
        assert_eq!(BackoffTable::new(&[100]).unwrap().delay(7), Duration::from_millis(100));
    }

    #[test]
    fn test_host_configuration_invariant() {
        let single = HostConfiguration::new(PRIMARY, None, 443);
        assert!(!single.has_secondary());
        assert_eq!(single.secondary_host(), None);
        assert_eq!(single.host_at(1), None);

        let pair = two_hosts();
        assert!(pair.has_secondary());
        assert_eq!(pair.host_at(1), Some(SECONDARY));

        assert_eq!(
            HostConfiguration::new("", None, 443).validate(),
            Err(FailoverConfigError::EmptyPrimary)
        );
        assert_eq!(
            HostConfiguration::new(PRIMARY, None, 0).validate(),
            Err(FailoverConfigError::ZeroPort)
        );
    }

    #[test]
    fn test_return_to_primary_after_retry_window() {
        let (manager, clock, _store) = manager_with(two_hosts());
        for _ in 0..3 {
            manager.report_failure(PRIMARY).unwrap();
        }
        assert!(!manager.should_retry_primary().unwrap());

        clock.advance_millis(DEFAULT_PRIMARY_RETRY_AFTER_MS);
        assert!(manager.should_retry_primary().unwrap());
        manager.return_to_primary().unwrap();
        assert_eq!(manager.active_host().unwrap(), ActiveHost::Primary);
        assert!(!manager.should_retry_primary().unwrap());
    }

    #[test]
    fn test_failover_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        {
            let state = Arc::new(DeviceState::init(Box::new(FileStateStore::new(&path)), two_hosts()).unwrap());
            let manager = FailoverManager::new(state, clock.clone(), FailoverPolicy::default());
            for _ in 0..3 {
                manager.report_failure(PRIMARY).unwrap();
            }
            manager.report_failure(SECONDARY).unwrap();
        }

        let state = Arc::new(DeviceState::init(Box::new(FileStateStore::new(&path)), two_hosts()).unwrap());
        let manager = FailoverManager::new(state, clock, FailoverPolicy::default());
        let restored = manager.snapshot().unwrap();
        assert_eq!(manager.active_host().unwrap(), ActiveHost::Secondary);
        assert_eq!(restored.consecutive_failures, 1);
        assert_eq!(restored.total_failures, 4);
    }

    #[test]
    fn test_forced_reconnect_is_published() {
        let (manager, _clock, _store) = manager_with(two_hosts());
        let mut events = manager.subscribe();
        manager.force_reconnect("malformed_traffic");
        assert_eq!(
            events.try_recv().unwrap(),
            FailoverEvent::ForcedReconnect {
                reason: "malformed_traffic".to_string()
            }
        );
    }
}
