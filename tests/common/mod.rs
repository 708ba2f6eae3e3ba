//! Common test utilities for E2E tests

#![allow(dead_code)]

use sunblock::{AppState, config};
use tempfile::TempDir;

pub const OWNER: &str = "did:plc:owner";

/// Sunblock wired to a mock XRPC service
pub struct TestEnv {
    pub server: mockito::ServerGuard,
    pub state: AppState,
    pub _temp_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment
    pub async fn new() -> Self {
        Self::with_subscriptions(Vec::new()).await
    }

    pub async fn with_subscriptions(subscriptions: Vec<String>) -> Self {
        let server = mockito::Server::new_async().await;

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            atproto: config::AtprotoConfig {
                service_url: server.url(),
                username: "owner.test".to_string(),
                password: "app-password".to_string(),
                request_timeout_seconds: 5,
                rate_limit: config::RateLimitConfig {
                    max_requests: 1000,
                    window_seconds: 60,
                },
            },
            blocking: config::BlockingConfig {
                follow_limit: 400,
                subscriptions,
            },
            database: config::DatabaseConfig { path: db_path },
            schedule: config::ScheduleConfig {
                enabled: false,
                interval_seconds: 3600,
            },
            metrics: config::MetricsConfig::default(),
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        Self {
            server,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Mock a successful login for the owner
    pub async fn mock_session(&mut self) -> mockito::Mock {
        self.server
            .mock("POST", "/xrpc/com.atproto.server.createSession")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"did":"{OWNER}","handle":"owner.test","accessJwt":"access-jwt","refreshJwt":"refresh-jwt"}}"#
            ))
            .create_async()
            .await
    }
}
