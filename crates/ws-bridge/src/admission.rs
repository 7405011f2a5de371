use std::net::IpAddr;
use std::sync::Arc;

use conn_limiter::{RateLimitExceeded, RateLimiter};
use http::StatusCode;
use thiserror::Error;
use upstream::{Destination, DestinationError};

use crate::origin::{OriginAllowlist, OriginRejection};

/// One inbound upgrade request, as seen by admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    source_ip: IpAddr,
    origin: Option<String>,
    target: String,
}

impl ConnectionAttempt {
    /// `target` is the raw `host[:port]` path segment.
    pub fn new(source_ip: IpAddr, origin: Option<String>, target: impl Into<String>) -> Self {
        Self {
            source_ip,
            origin,
            target: target.into(),
        }
    }

    pub fn source_ip(&self) -> IpAddr {
        self.source_ip
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target parsed as a dialable destination.
    pub fn destination(&self) -> Result<Destination, DestinationError> {
        Destination::parse(&self.target)
    }

    /// Host to dial; `None` when the target does not parse.
    pub fn requested_host(&self) -> Option<String> {
        self.destination().ok().map(|dest| dest.host().to_string())
    }

    /// Port to dial, [`DEFAULT_PORT`](upstream::DEFAULT_PORT) when the target
    /// names none; `None` when the target does not parse.
    pub fn requested_port(&self) -> Option<u16> {
        self.destination().ok().map(|dest| dest.port())
    }

    /// `true` only for a valid target whose host is a Tor hidden service.
    pub fn is_tor_destination(&self) -> bool {
        self.destination().is_ok_and(|dest| dest.is_tor())
    }
}

/// An attempt that passed every check, with the destination to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub destination: Destination,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(#[from] OriginRejection),

    #[error("missing destination")]
    MissingDestination,

    #[error("invalid destination: {0}")]
    InvalidDestination(DestinationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
}

impl AdmissionError {
    /// HTTP status sent back for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OriginNotAllowed(_) | Self::MissingDestination | Self::InvalidDestination(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Short machine-readable label for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::OriginNotAllowed(_) => "origin-not-allowed",
            Self::MissingDestination => "missing-destination",
            Self::InvalidDestination(_) => "invalid-destination",
            Self::RateLimited(_) => "rate-limited",
        }
    }
}

impl From<DestinationError> for AdmissionError {
    fn from(err: DestinationError) -> Self {
        match err {
            DestinationError::Missing => Self::MissingDestination,
            other => Self::InvalidDestination(other),
        }
    }
}

/// Decides whether an upgrade request may proceed to dialing.
///
/// Checks run in a fixed order and stop at the first failure: origin,
/// destination, then rate limit. Only the last one touches shared state, so
/// a request rejected for its origin or destination never spends a point.
/// Per-IP consistency under concurrent requests is left to the limiter.
#[derive(Clone)]
pub struct AdmissionController {
    allowlist: OriginAllowlist,
    limiter: Arc<dyn RateLimiter>,
}

impl AdmissionController {
    pub fn new(allowlist: OriginAllowlist, limiter: Arc<dyn RateLimiter>) -> Self {
        Self { allowlist, limiter }
    }

    pub fn allowlist(&self) -> &OriginAllowlist {
        &self.allowlist
    }

    pub async fn admit(&self, attempt: &ConnectionAttempt) -> Result<Admitted, AdmissionError> {
        self.allowlist.check(attempt.origin())?;

        let destination = attempt.destination()?;

        self.limiter
            .consume(&attempt.source_ip().to_string())
            .await?;

        Ok(Admitted { destination })
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("allowlist", &self.allowlist)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use conn_limiter::{Consumed, LimiterOptions, MemoryRateLimiter};

    /// Counts consume calls and always grants.
    #[derive(Default)]
    struct CountingLimiter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RateLimiter for CountingLimiter {
        async fn consume(&self, _key: &str) -> Result<Consumed, RateLimitExceeded> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Consumed {
                remaining_points: 1,
                resets_in: Duration::from_secs(1),
            })
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn attempt(origin: Option<&str>, target: &str) -> ConnectionAttempt {
        ConnectionAttempt::new(ip("198.51.100.7"), origin.map(str::to_string), target)
    }

    #[test]
    fn attempt_exposes_requested_host_and_port() {
        let plain = attempt(None, "203.0.113.5:9736");
        assert_eq!(plain.requested_host().as_deref(), Some("203.0.113.5"));
        assert_eq!(plain.requested_port(), Some(9736));
        assert!(!plain.is_tor_destination());

        let onion = attempt(None, "abc123xyz.onion");
        assert_eq!(onion.requested_host().as_deref(), Some("abc123xyz.onion"));
        assert_eq!(onion.requested_port(), Some(9735));
        assert!(onion.is_tor_destination());

        assert_eq!(attempt(None, "[::1]:9000").requested_host().as_deref(), Some("::1"));
    }

    #[test]
    fn accessors_agree_with_admission_parse() {
        for target in ["host:1:2", "x.onion:abc", "", ":9735"] {
            let rejected = attempt(None, target);
            assert!(rejected.destination().is_err(), "{target} should not parse");
            assert_eq!(rejected.requested_host(), None);
            assert_eq!(rejected.requested_port(), None);
            assert!(!rejected.is_tor_destination());
        }
    }

    #[tokio::test]
    async fn disallowed_origin_is_400_and_spends_nothing() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller = AdmissionController::new(
            OriginAllowlist::new(["https://wallet.example"]),
            limiter.clone(),
        );

        for origin in [Some("https://evil.example"), None] {
            let err = controller
                .admit(&attempt(origin, "203.0.113.5:9735"))
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert_eq!(err.reason(), "origin-not-allowed");
        }
        assert_eq!(limiter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowlist_entries_are_not_patterns() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller =
            AdmissionController::new(OriginAllowlist::new(["https://*"]), limiter.clone());

        let err = controller
            .admit(&attempt(Some("https://evil.example"), "203.0.113.5:9735"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::OriginNotAllowed(_)));
        assert_eq!(limiter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn origin_is_checked_before_destination() {
        let controller = AdmissionController::new(
            OriginAllowlist::new(["https://wallet.example"]),
            Arc::new(CountingLimiter::default()),
        );
        let err = controller
            .admit(&attempt(Some("https://evil.example"), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::OriginNotAllowed(_)));
    }

    #[tokio::test]
    async fn missing_destination_is_400_and_spends_nothing() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller = AdmissionController::new(OriginAllowlist::default(), limiter.clone());

        let err = controller.admit(&attempt(None, "")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::MissingDestination));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = controller.admit(&attempt(None, "host:nope")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidDestination(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        assert_eq!(limiter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn admitted_attempt_consumes_once_and_carries_destination() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller = AdmissionController::new(
            OriginAllowlist::new(["https://wallet.example"]),
            limiter.clone(),
        );

        let admitted = controller
            .admit(&attempt(Some("https://wallet.example"), "abc123xyz.onion"))
            .await
            .unwrap();
        assert_eq!(admitted.destination, Destination::new("abc123xyz.onion", 9735));
        assert_eq!(limiter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_attempt_from_one_ip_is_429() {
        let controller = AdmissionController::new(
            OriginAllowlist::default(),
            Arc::new(MemoryRateLimiter::new(LimiterOptions::default())),
        );

        for _ in 0..10 {
            controller
                .admit(&attempt(None, "203.0.113.5"))
                .await
                .unwrap();
        }
        let err = controller
            .admit(&attempt(None, "203.0.113.5"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.reason(), "rate-limited");

        // Another client is unaffected.
        let other = ConnectionAttempt::new(ip("198.51.100.8"), None, "203.0.113.5");
        assert!(controller.admit(&other).await.is_ok());

        // The window rolls over.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(controller.admit(&attempt(None, "203.0.113.5")).await.is_ok());
    }
}
