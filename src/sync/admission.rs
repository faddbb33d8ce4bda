//! Connection admission control.
//!
//! Every connection attempt is checked against a per-address quota before
//! it touches the replica registry. The production limiter is a keyed
//! `governor` token bucket: `max_connections` attempts may burst at once and
//! the bucket refills evenly over `window`.

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("too many connection attempts from {0}")]
    RateLimited(IpAddr),
}

/// Approves or rejects a new connection attempt by client address.
#[async_trait]
pub trait AdmissionControl: Send + Sync + 'static {
    async fn admit(&self, addr: IpAddr) -> Result<(), AdmissionError>;

    /// Drop bookkeeping for addresses that have fully recovered their quota.
    fn prune(&self) {}
}

/// Admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Connection attempts allowed per address per window
    pub max_connections: u32,
    /// Window over which the quota refills
    pub window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-address token bucket
pub struct RateLimitAdmission {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl RateLimitAdmission {
    pub fn new(config: AdmissionConfig) -> Self {
        let burst = NonZeroU32::new(config.max_connections).unwrap_or(NonZeroU32::MIN);
        let period = config.window / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
        }
    }
}

#[async_trait]
impl AdmissionControl for RateLimitAdmission {
    async fn admit(&self, addr: IpAddr) -> Result<(), AdmissionError> {
        self.limiter
            .check_key(&addr)
            .map_err(|_| AdmissionError::RateLimited(addr))
    }

    fn prune(&self) {
        self.limiter.retain_recent();
    }
}

/// Admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl AdmissionControl for AllowAll {
    async fn admit(&self, _addr: IpAddr) -> Result<(), AdmissionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_burst_then_reject() {
        let admission = RateLimitAdmission::new(AdmissionConfig {
            max_connections: 3,
            window: Duration::from_secs(60),
        });
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        for _ in 0..3 {
            assert!(admission.admit(addr).await.is_ok());
        }
        assert_eq!(
            admission.admit(addr).await,
            Err(AdmissionError::RateLimited(addr))
        );
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let admission = RateLimitAdmission::new(AdmissionConfig {
            max_connections: 1,
            window: Duration::from_secs(60),
        });
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(admission.admit(a).await.is_ok());
        assert!(admission.admit(a).await.is_err());
        assert!(admission.admit(b).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_limit_still_admits_one() {
        let admission = RateLimitAdmission::new(AdmissionConfig {
            max_connections: 0,
            window: Duration::from_secs(60),
        });
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert!(admission.admit(addr).await.is_ok());
        assert!(admission.admit(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_allow_all() {
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..100 {
            assert!(AllowAll.admit(addr).await.is_ok());
        }
    }
}
