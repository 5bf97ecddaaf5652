#[cfg(test)]
mod integration_tests {
    use crate::app::{DeviceRuntime, RuntimeParts};
    use crate::capture::ScriptedCapture;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::indicator::LogIndicator;
    use crate::monitoring::HealthStatus;
    use crate::playback::NullSink;
    use crate::store::MemoryStateStore;
    use crate::tests::support::{DuplexConnector, read_http_request, token_body, write_http_response};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const PRIMARY: &str = "primary.example.com";
    const SECONDARY: &str = "backup.example.com";

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.device.device_id = "companion-0042".to_string();
        config.device.child_id = "child-7".to_string();
        config.hosts.primary = PRIMARY.to_string();
        config.hosts.secondary = Some(SECONDARY.to_string());
        config.alerting.audit_log_path = Some(dir.path().join("audit.jsonl"));
        config.alerting.fallback_path = Some(dir.path().join("fallback.jsonl"));
        config.storage.state_path = Some(dir.path().join("state.toml"));
        config
    }

    fn runtime(config: AppConfig, connector: Arc<DuplexConnector>, store: Arc<MemoryStateStore>) -> DeviceRuntime {
        let parts = RuntimeParts {
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
            connector,
            store: Box::new(store),
            indicator: Arc::new(LogIndicator::new()),
            capture: ScriptedCapture::factory(Vec::new(), 160),
            sink: NullSink::new().factory(),
        };
        DeviceRuntime::assemble(config, parts).unwrap()
    }

    fn serve_pairing(connector: &DuplexConnector, status: u16) {
        connector.serve(move |mut stream| async move {
            read_http_request(&mut stream).await;
            if status == 200 {
                write_http_response(&mut stream, 200, &token_body("access-xyz")).await;
            } else {
                write_http_response(&mut stream, status, r#"{"detail":"denied"}"#).await;
            }
        });
    }

    #[tokio::test]
    async fn test_fresh_runtime_reports_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(
            test_config(&dir),
            Arc::new(DuplexConnector::new()),
            Arc::new(MemoryStateStore::new()),
        );
        let report = runtime.health_report();
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 3);
        assert!(!runtime.lockdown().is_active());
    }

    #[tokio::test]
    async fn test_pair_once_counts_success_against_primary() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(DuplexConnector::new());
        serve_pairing(&connector, 200);
        let runtime = runtime(test_config(&dir), connector.clone(), Arc::new(MemoryStateStore::new()));

        let tokens = runtime.pair_once().await.unwrap();
        assert_eq!(tokens.access_token, "access-xyz");
        assert_eq!(connector.attempts(), vec![PRIMARY.to_string()]);
        assert_eq!(runtime.failover_state().unwrap().primary_successes, 1);
    }

    #[tokio::test]
    async fn test_rejected_pairing_counts_as_failure_and_degrades_health() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(DuplexConnector::new());
        serve_pairing(&connector, 401);
        let runtime = runtime(test_config(&dir), connector, Arc::new(MemoryStateStore::new()));

        assert!(runtime.pair_once().await.is_err());
        let state = runtime.failover_state().unwrap();
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.backoff_level, 1);

        let report = runtime.health_report();
        assert_eq!(report.overall_status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_repeated_pairing_failures_move_to_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(DuplexConnector::new());
        let store = Arc::new(MemoryStateStore::new());
        let runtime = runtime(test_config(&dir), connector.clone(), store.clone());

        // No server scripted: every connect is refused
        for _ in 0..3 {
            assert!(runtime.pair_once().await.is_err());
        }
        assert_eq!(
            connector.attempts(),
            vec![PRIMARY.to_string(), PRIMARY.to_string(), PRIMARY.to_string()]
        );
        assert!(runtime.failover_state().unwrap().is_in_failover_mode);
        assert_eq!(store.snapshot().unwrap().failover.current_host_index, 1);

        serve_pairing(&connector, 200);
        runtime.pair_once().await.unwrap();
        assert_eq!(connector.attempts().last().map(String::as_str), Some(SECONDARY));
        assert_eq!(runtime.failover_state().unwrap().secondary_successes, 1);
    }

    #[test]
    fn test_invalid_config_is_refused_at_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.device.device_id = String::new();
        let parts = RuntimeParts {
            clock: Arc::new(ManualClock::new(0)),
            connector: Arc::new(DuplexConnector::new()),
            store: Box::new(MemoryStateStore::new()),
            indicator: Arc::new(LogIndicator::new()),
            capture: ScriptedCapture::factory(Vec::new(), 1),
            sink: NullSink::new().factory(),
        };
        assert!(DeviceRuntime::assemble(config, parts).is_err());
    }

    #[tokio::test]
    async fn test_run_requires_a_child_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.device.child_id = String::new();
        let runtime = runtime(config, Arc::new(DuplexConnector::new()), Arc::new(MemoryStateStore::new()));
        let (_controls, controls_rx) = mpsc::channel(1);
        assert!(runtime.run(controls_rx).await.is_err());
    }

    #[tokio::test]
    async fn test_store_write_failures_do_not_stop_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.failover.backoff_ms = vec![20, 40, 80];
        // Nothing scripted: every connect is refused and every failure must be recorded
        let connector = Arc::new(DuplexConnector::new());
        let store = Arc::new(MemoryStateStore::new());
        let runtime = runtime(config, connector.clone(), store.clone());
        store.set_fail_writes(true);
        let failover = Arc::clone(runtime.failover());
        let shutdown = runtime.shutdown_handle();
        let (_controls, controls_rx) = mpsc::channel(4);

        let driver = async {
            while connector.attempts().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            shutdown.send_replace(true);
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(runtime.run(controls_rx), driver)
        })
        .await
        .expect("runtime stopped retrying");

        result.unwrap();
        // Nothing was committed, in memory or in the store
        assert_eq!(failover.snapshot().unwrap().consecutive_failures, 0);
        assert_eq!(store.snapshot().unwrap().failover.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_runtime_pairs_streams_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(DuplexConnector::new());
        serve_pairing(&connector, 200);
        connector.serve(|stream| async move {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let store = Arc::new(MemoryStateStore::new());
        let runtime = runtime(test_config(&dir), connector.clone(), store.clone());
        let failover = Arc::clone(runtime.failover());
        let shutdown = runtime.shutdown_handle();
        let (_controls, controls_rx) = mpsc::channel(4);

        let driver = async {
            // The streaming connection counts as the host's success once it is open
            while failover.snapshot().unwrap().primary_successes == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            shutdown.send_replace(true);
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(runtime.run(controls_rx), driver)
        })
        .await
        .expect("runtime did not shut down");

        result.unwrap();
        assert_eq!(connector.attempts(), vec![PRIMARY.to_string(), PRIMARY.to_string()]);
        let committed = store.snapshot().unwrap();
        assert_eq!(committed.failover.consecutive_failures, 0);
        assert!(!committed.lockdown.active);
    }
}
