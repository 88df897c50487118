//! Route‑scoped rate limiting built atop `governor`.
//!
//! Exposes a small enum (`RouteRateLimiter`) that encapsulates one of several
//! limiter modes (whole route, per client IP, per header value) with unified
//! `check` semantics returning [`GatewayError::RateLimited`] on violation.
//! `requests` per `period` is expressed as a GCRA quota replenishing one cell
//! every `period / requests` with a burst of `requests`.
use std::{fmt, hash::Hash, net::IpAddr, num::NonZeroU32, sync::Arc};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use http::{HeaderMap, HeaderName, StatusCode};

use crate::{
    config::models::{MissingKeyPolicy, RateLimitBy, RateLimitConfig},
    core::error::GatewayError,
};

/// Internal wrapper bundling a concrete governor limiter instance with
/// response metadata (status + message) and behaviour on missing key.
pub struct LimiterWrapper<RL> {
    pub limiter: RL,
    pub status_code: StatusCode,
    pub message: String,
    pub on_missing_key: MissingKeyPolicy,
    /// Keys (client IPs or header values) never limited.
    pub whitelist: Vec<String>,
}

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Non‑keyed (global per route) limiter variant.
pub type RouteSpecificLimiter = LimiterWrapper<DirectRateLimiterImpl>;
/// Per‑client‑IP keyed limiter variant.
pub type IpLimiter = LimiterWrapper<KeyedRateLimiterImpl<IpAddr>>;
/// Per‑header‑value keyed limiter variant.
pub type HeaderLimiter = LimiterWrapper<KeyedRateLimiterImpl<String>>;

impl<RL> LimiterWrapper<RL> {
    fn rejection(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::RateLimited {
            status: self.status_code,
            message: message.into(),
        }
    }

    fn is_whitelisted(&self, key: &str) -> bool {
        self.whitelist.iter().any(|allowed| allowed == key)
    }

    fn missing_key(&self, message: String) -> Result<(), GatewayError> {
        match self.on_missing_key {
            MissingKeyPolicy::Allow => Ok(()),
            MissingKeyPolicy::Deny => Err(self.rejection(message)),
        }
    }
}

impl LimiterWrapper<DirectRateLimiterImpl> {
    pub fn check_route(&self) -> Result<(), GatewayError> {
        if self.limiter.check().is_err() {
            Err(self.rejection(self.message.clone()))
        } else {
            Ok(())
        }
    }
}

impl<K> LimiterWrapper<KeyedRateLimiterImpl<K>>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
{
    fn check_keyed(&self, key: &K) -> Result<(), GatewayError> {
        if self.limiter.check_key(key).is_err() {
            Err(self.rejection(self.message.clone()))
        } else {
            Ok(())
        }
    }
}

impl IpLimiter {
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), GatewayError> {
        if self.is_whitelisted(&ip.to_string()) {
            return Ok(());
        }
        self.check_keyed(&ip)
    }
}

impl HeaderLimiter {
    pub fn check_header_value(&self, value: &str) -> Result<(), GatewayError> {
        if self.is_whitelisted(value) {
            return Ok(());
        }
        self.check_keyed(&value.to_string())
    }
}

/// Discriminated union over supported limiter types.
#[derive(Clone)]
pub enum RouteRateLimiter {
    Route(Arc<RouteSpecificLimiter>),
    Ip(Arc<IpLimiter>),
    Header {
        limiter: Arc<HeaderLimiter>,
        header_name: HeaderName,
    },
}

impl fmt::Debug for RouteRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRateLimiter::Route(_) => f.write_str("RouteRateLimiter::Route"),
            RouteRateLimiter::Ip(_) => f.write_str("RouteRateLimiter::Ip"),
            RouteRateLimiter::Header { header_name, .. } => {
                write!(f, "RouteRateLimiter::Header({header_name})")
            }
        }
    }
}

impl RouteRateLimiter {
    /// Build a limiter from a `RateLimitConfig` definition.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let period_duration = humantime::parse_duration(&config.period).map_err(|e| {
            format!(
                "Invalid period string '{period}': {e}",
                period = config.period
            )
        })?;

        let requests = u32::try_from(config.requests)
            .map_err(|_| format!("Rate limit 'requests' is too large: {}", config.requests))?;
        let quota_requests = NonZeroU32::new(requests)
            .ok_or_else(|| "Rate limit 'requests' must be greater than 0".to_string())?;

        let quota = Quota::with_period(period_duration / requests)
            .ok_or_else(|| format!("Invalid period duration: {period_duration:?}"))?
            .allow_burst(quota_requests);

        let status_code = StatusCode::from_u16(config.status_code)
            .map_err(|_| format!("Invalid status code: {}", config.status_code))?;

        tracing::debug!(
            "Creating rate limiter: by={:?}, requests={}, period={}, status_code={}, on_missing_key={:?}, whitelist={}",
            config.by,
            config.requests,
            config.period,
            config.status_code,
            config.on_missing_key,
            config.client_whitelist.len()
        );

        match config.by {
            RateLimitBy::Route => Ok(RouteRateLimiter::Route(Arc::new(LimiterWrapper {
                limiter: RateLimiter::direct(quota),
                status_code,
                message: config.message.clone(),
                on_missing_key: config.on_missing_key,
                whitelist: config.client_whitelist.clone(),
            }))),
            RateLimitBy::Ip => Ok(RouteRateLimiter::Ip(Arc::new(LimiterWrapper {
                limiter: RateLimiter::keyed(quota),
                status_code,
                message: config.message.clone(),
                on_missing_key: config.on_missing_key,
                whitelist: config.client_whitelist.clone(),
            }))),
            RateLimitBy::Header => {
                let header_name_str = config
                    .header_name
                    .as_ref()
                    .ok_or_else(|| "header_name is required for RateLimitBy::Header".to_string())?;
                let header_name = HeaderName::from_bytes(header_name_str.as_bytes())
                    .map_err(|e| format!("Invalid header_name '{header_name_str}': {e}"))?;
                Ok(RouteRateLimiter::Header {
                    limiter: Arc::new(LimiterWrapper {
                        limiter: RateLimiter::keyed(quota),
                        status_code,
                        message: config.message.clone(),
                        on_missing_key: config.on_missing_key,
                        whitelist: config.client_whitelist.clone(),
                    }),
                    header_name,
                })
            }
        }
    }

    /// Enforce this limiter against one request.
    pub fn check(&self, headers: &HeaderMap, client_ip: Option<IpAddr>) -> Result<(), GatewayError> {
        match self {
            RouteRateLimiter::Route(limiter) => {
                if let Some(ip) = client_ip {
                    if limiter.is_whitelisted(&ip.to_string()) {
                        return Ok(());
                    }
                }
                limiter.check_route()
            }
            RouteRateLimiter::Ip(limiter) => match client_ip {
                Some(ip) => limiter.check_ip(ip),
                None => limiter.missing_key("No client IP available".to_string()),
            },
            RouteRateLimiter::Header {
                limiter,
                header_name,
            } => {
                let header_value = headers.get(header_name).and_then(|hv| hv.to_str().ok());
                match header_value {
                    Some(value) => limiter.check_header_value(value),
                    None => {
                        limiter.missing_key(format!("Required header '{header_name}' is missing"))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn create_test_rate_limit_config() -> RateLimitConfig {
        RateLimitConfig {
            by: RateLimitBy::Route,
            header_name: None,
            requests: 5,
            period: "1m".to_string(),
            status_code: 429,
            message: "Too Many Requests".to_string(),
            on_missing_key: MissingKeyPolicy::Allow,
            client_whitelist: Vec::new(),
        }
    }

    #[test]
    fn test_invalid_period() {
        let mut config = create_test_rate_limit_config();
        config.period = "invalid".to_string();
        assert!(RouteRateLimiter::new(&config).is_err());
    }

    #[test]
    fn test_zero_requests() {
        let mut config = create_test_rate_limit_config();
        config.requests = 0;
        assert!(RouteRateLimiter::new(&config).is_err());
    }

    #[test]
    fn test_header_limiter_missing_header_name() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Header;
        assert!(RouteRateLimiter::new(&config).is_err());
    }

    #[test]
    fn test_route_limiter_allows_burst_then_rejects() {
        let limiter = RouteRateLimiter::new(&create_test_rate_limit_config()).unwrap();
        let headers = HeaderMap::new();

        for _ in 0..5 {
            assert!(limiter.check(&headers, None).is_ok());
        }
        let err = limiter.check(&headers, None).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_ip_limiter_is_per_client_and_honours_whitelist() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Ip;
        config.requests = 1;
        config.client_whitelist = vec!["10.0.0.9".to_string()];
        let limiter = RouteRateLimiter::new(&config).unwrap();
        let headers = HeaderMap::new();

        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let vip: IpAddr = "10.0.0.9".parse().unwrap();

        assert!(limiter.check(&headers, Some(a)).is_ok());
        assert!(limiter.check(&headers, Some(a)).is_err());
        assert!(limiter.check(&headers, Some(b)).is_ok());
        for _ in 0..3 {
            assert!(limiter.check(&headers, Some(vip)).is_ok());
        }
    }

    #[test]
    fn test_header_limiter_missing_key_policy() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Header;
        config.header_name = Some("x-api-key".to_string());
        config.on_missing_key = MissingKeyPolicy::Deny;
        config.status_code = 503;
        let limiter = RouteRateLimiter::new(&config).unwrap();

        let err = limiter.check(&HeaderMap::new(), None).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert!(limiter.check(&headers, None).is_ok());
    }
}
