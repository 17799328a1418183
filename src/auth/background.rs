// Proactive token refresh
// Refreshes ahead of expiry so requests rarely hit an expired token

use chrono::Duration;
use tokio::task::JoinHandle;

use super::manager::CredentialRefreshCoordinator;
use super::types::TokenKind;

/// Timing for the background refresher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRefreshConfig {
    /// How often the access token expiry is checked
    pub check_interval: std::time::Duration,
    /// Refresh once the access token expires within this window
    pub threshold: std::time::Duration,
}

impl Default for AutoRefreshConfig {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(60),
            threshold: std::time::Duration::from_secs(300),
        }
    }
}

/// What a single check decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCheck {
    /// No session to keep alive
    Idle,
    /// Access token is outside the threshold window
    Fresh,
    /// Access token already expired; left to the next caller
    Expired,
    Refreshed,
    Failed,
}

/// Run one expiry check, refreshing if the access token is about to expire
pub async fn check_and_refresh(
    coordinator: &CredentialRefreshCoordinator,
    threshold: std::time::Duration,
) -> RefreshCheck {
    if !coordinator.is_authenticated() {
        return RefreshCheck::Idle;
    }

    let window = Duration::from_std(threshold).unwrap_or_else(|_| Duration::days(3650));
    if !coordinator.needs_refresh_within(window) {
        return RefreshCheck::Fresh;
    }
    if coordinator.is_expired(TokenKind::Access) {
        return RefreshCheck::Expired;
    }

    tracing::debug!("Access token expiring soon, refreshing ahead of time");
    match coordinator.refresh().await {
        Ok(_) => RefreshCheck::Refreshed,
        Err(e) => {
            tracing::error!("Background token refresh failed: {}", e);
            RefreshCheck::Failed
        }
    }
}

/// Spawn the background refresher; abort the handle to stop it
pub fn spawn_auto_refresh(
    coordinator: CredentialRefreshCoordinator,
    config: AutoRefreshConfig,
) -> JoinHandle<()> {
    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        threshold_secs = config.threshold.as_secs(),
        "Starting background token refresh"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            check_and_refresh(&coordinator, config.threshold).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::expiry::encode_test_jwt;
    use crate::auth::{CredentialPair, RefreshTransport};
    use crate::error::TransportError;
    use crate::http_client::{RequestSpec, RequestTransport, TransportResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RefreshTransport for CountingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<CredentialPair, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CredentialPair::new(
                encode_test_jwt(&format!("a{}", n), (Utc::now() + Duration::hours(1)).timestamp()),
                encode_test_jwt("r", (Utc::now() + Duration::days(7)).timestamp()),
            ))
        }

        async fn login(&self, _: &str, _: &str) -> Result<CredentialPair, TransportError> {
            Err(TransportError::Network("unused".to_string()))
        }

        async fn logout(&self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NoRequests;

    #[async_trait]
    impl RequestTransport for NoRequests {
        async fn send(
            &self,
            _spec: &RequestSpec,
            _access_token: &str,
            _refresh_token: Option<&str>,
        ) -> Result<TransportResponse, TransportError> {
            Err(TransportError::Network("unused".to_string()))
        }
    }

    fn setup() -> (Arc<CountingRefresher>, CredentialRefreshCoordinator) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let coord =
            CredentialRefreshCoordinator::builder(refresher.clone(), Arc::new(NoRequests)).build();
        (refresher, coord)
    }

    fn token_expiring_in(sub: &str, d: Duration) -> String {
        encode_test_jwt(sub, (Utc::now() + d).timestamp())
    }

    #[tokio::test]
    async fn test_check_without_session() {
        let (refresher, coord) = setup();
        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(300)).await,
            RefreshCheck::Idle
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_leaves_fresh_token_alone() {
        let (refresher, coord) = setup();
        coord.set_credentials(CredentialPair::new(
            token_expiring_in("a", Duration::hours(1)),
            token_expiring_in("r", Duration::days(1)),
        ));
        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(300)).await,
            RefreshCheck::Fresh
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_refreshes_inside_window() {
        let (refresher, coord) = setup();
        let expiring = token_expiring_in("a", Duration::minutes(2));
        coord.set_credentials(CredentialPair::new(
            expiring.clone(),
            token_expiring_in("r", Duration::days(1)),
        ));

        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(300)).await,
            RefreshCheck::Refreshed
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_ne!(coord.credentials().access_token, Some(expiring));
    }

    #[tokio::test]
    async fn test_check_skips_expired_token() {
        let (refresher, coord) = setup();
        coord.set_credentials(CredentialPair::new(
            token_expiring_in("a", Duration::minutes(-1)),
            token_expiring_in("r", Duration::days(1)),
        ));
        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(300)).await,
            RefreshCheck::Expired
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_with_unbounded_threshold() {
        let (refresher, coord) = setup();
        coord.set_credentials(CredentialPair::new(
            token_expiring_in("a", Duration::hours(1)),
            token_expiring_in("r", Duration::days(1)),
        ));

        // Window reaches past the end of the calendar
        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(9_000_000_000_000_000)).await,
            RefreshCheck::Refreshed
        );
        assert_eq!(
            check_and_refresh(&coord, std::time::Duration::from_secs(u64::MAX)).await,
            RefreshCheck::Refreshed
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_refreshes_on_tick() {
        let (refresher, coord) = setup();
        coord.set_credentials(CredentialPair::new(
            token_expiring_in("a", Duration::minutes(2)),
            token_expiring_in("r", Duration::days(1)),
        ));

        let handle = spawn_auto_refresh(coord.clone(), AutoRefreshConfig::default());
        // First tick fires immediately
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // The new token is an hour out, later ticks leave it alone
        tokio::time::sleep(std::time::Duration::from_secs(180)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[test]
    fn test_check_reports_failure_and_clears() {
        struct Rejecting;

        #[async_trait]
        impl RefreshTransport for Rejecting {
            async fn refresh(&self, _: &str) -> Result<CredentialPair, TransportError> {
                Err(TransportError::Status {
                    status: 401,
                    message: "revoked".to_string(),
                })
            }

            async fn login(&self, _: &str, _: &str) -> Result<CredentialPair, TransportError> {
                Err(TransportError::Network("unused".to_string()))
            }

            async fn logout(&self, _: &str) -> Result<(), TransportError> {
                Ok(())
            }
        }

        let coord =
            CredentialRefreshCoordinator::builder(Arc::new(Rejecting), Arc::new(NoRequests)).build();
        coord.set_credentials(CredentialPair::new(
            token_expiring_in("a", Duration::minutes(1)),
            token_expiring_in("r", Duration::days(1)),
        ));

        let outcome = tokio_test::block_on(check_and_refresh(
            &coord,
            std::time::Duration::from_secs(300),
        ));
        assert_eq!(outcome, RefreshCheck::Failed);
        assert!(!coord.is_authenticated());
    }

    #[test]
    fn test_default_config() {
        let config = AutoRefreshConfig::default();
        assert_eq!(config.check_interval.as_secs(), 60);
        assert_eq!(config.threshold.as_secs(), 300);
    }
}
