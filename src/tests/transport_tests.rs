#[cfg(test)]
mod transport_tests {
    use crate::clock::ManualClock;
    use crate::http;
    use crate::tests::support::{DuplexConnector, serve_http};
    use crate::transport::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn unsynchronized_transport() -> SecureTransport {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_synchronized(false);
        SecureTransport::new(TransportConfig::default(), clock).unwrap()
    }

    #[tokio::test]
    async fn test_unsynchronized_clock_fails_fast() {
        let transport = unsynchronized_transport();
        let started = Instant::now();
        let result = transport.connect("api.example.com", 443).await;
        assert!(matches!(result, Err(TransportError::ClockNotSynchronized)));
        // Refused before any DNS or TCP work
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ip_literals_are_refused() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let transport = SecureTransport::new(TransportConfig::default(), clock).unwrap();
        for host in ["127.0.0.1", "[::1]", "::1", ""] {
            let result = transport.connect(host, 443).await;
            assert!(matches!(result, Err(TransportError::InvalidHost(_))), "host {:?}", host);
        }
    }

    #[test]
    fn test_hostname_validation() {
        assert!(validate_hostname("api.example.com").is_ok());
        assert!(validate_hostname("localhost").is_ok());
        assert!(validate_hostname("10.0.0.1").is_err());
        assert!(validate_hostname("bad host name").is_err());
    }

    #[test]
    fn test_failure_classification_by_elapsed_time() {
        let budget = Duration::from_secs(15);
        assert_eq!(
            FailureClass::from_elapsed(Duration::from_millis(20), budget),
            FailureClass::EarlyNetwork
        );
        assert_eq!(FailureClass::from_elapsed(Duration::from_secs(4), budget), FailureClass::Handshake);
        assert_eq!(
            FailureClass::from_elapsed(Duration::from_secs(15), budget),
            FailureClass::LateTimeout
        );
    }

    #[test]
    fn test_every_failure_carries_a_reason_tag() {
        let failed = TransportError::failed(FailureClass::Handshake, Duration::from_secs(3), "bad certificate");
        assert_eq!(failed.reason_tag(), "handshake-failure");
        assert_eq!(TransportError::ClockNotSynchronized.reason_tag(), "clock-not-synchronized");
        assert_eq!(TransportError::InsecureModeRefused.reason_tag(), "insecure-mode-refused");
    }

    #[test]
    fn test_default_timeouts() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(!config.allow_insecure);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_insecure_mode_available_in_debug_builds() {
        let config = TransportConfig {
            allow_insecure: true,
            ..TransportConfig::default()
        };
        assert!(SecureTransport::new(config, Arc::new(ManualClock::new(0))).is_ok());
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_insecure_mode_refused_in_release_builds() {
        let config = TransportConfig {
            allow_insecure: true,
            ..TransportConfig::default()
        };
        assert!(matches!(
            SecureTransport::new(config, Arc::new(ManualClock::new(0))),
            Err(TransportError::InsecureModeRefused)
        ));
    }

    #[tokio::test]
    async fn test_post_json_round_trip_over_connector() {
        let connector = DuplexConnector::new();
        let seen = serve_http(&connector, 202, r#"{"ok":true}"#);

        let response = http::post_json(&connector, "api.example.com", 443, "/alerts", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.body, br#"{"ok":true}"#);
        assert_eq!(seen.lock().unwrap().clone(), Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_post_json_surfaces_refused_connection_as_transport_error() {
        let connector = DuplexConnector::new();
        let result = http::post_json(&connector, "api.example.com", 443, "/alerts", &serde_json::json!({})).await;
        assert!(matches!(result, Err(http::HttpError::Transport(_))));
    }
}
