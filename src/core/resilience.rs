//! Timeout, circuit breaking and retry around a downstream call.
//!
//! Every attempt re-runs destination selection, takes a breaker permit for the
//! chosen destination, and is bounded by the route's timeout. Only connection
//! failures are retried, and only for the policy's retry methods; each attempt
//! is counted by its own destination's breaker.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use rand::Rng;
use tracing::Instrument;

use crate::{
    config::ResiliencePolicyConfig,
    core::{
        backend::Destination,
        circuit_breaker::{BreakerSettings, BreakerTransition},
        dispatcher::{Dispatcher, PreparedRequest},
        error::GatewayError,
        snapshot::Cluster,
    },
    metrics::{DestinationRequestTimer, increment_destination_request_total},
    ports::{
        event_sink::{EventSink, GatewayEvent},
        http_client::DispatchError,
    },
    tracing_setup::create_destination_span,
};

/// Resolved resilience parameters for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResiliencePolicy {
    pub name: String,
    pub breaker: BreakerSettings,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_methods: Vec<Method>,
    pub retry_backoff: Duration,
    pub failure_status_codes: Vec<StatusCode>,
}

impl ResiliencePolicy {
    pub fn from_config(name: &str, config: &ResiliencePolicyConfig) -> Result<Self, String> {
        let duration = |field: &str, value: &str| {
            humantime::parse_duration(value)
                .map_err(|e| format!("policy '{name}': invalid {field} '{value}': {e}"))
        };

        if config.failure_threshold == 0 {
            return Err(format!("policy '{name}': failure_threshold must be > 0"));
        }

        Ok(Self {
            name: name.to_string(),
            breaker: BreakerSettings {
                failure_threshold: config.failure_threshold,
                failure_window: duration("failure_window", &config.failure_window)?,
                break_duration: duration("break_duration", &config.break_duration)?,
                half_open_max_trials: config.half_open_max_trials.max(1),
            },
            timeout: duration("timeout", &config.timeout)?,
            retry_count: config.retry_count,
            retry_methods: config
                .retry_methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| format!("policy '{name}': invalid retry method '{m}'"))
                })
                .collect::<Result<_, _>>()?,
            retry_backoff: duration("retry_backoff", &config.retry_backoff)?,
            failure_status_codes: config
                .failure_status_codes
                .iter()
                .map(|code| {
                    StatusCode::from_u16(*code)
                        .map_err(|_| format!("policy '{name}': invalid status code {code}"))
                })
                .collect::<Result<_, _>>()?,
        })
    }

    /// Total attempts allowed for `method`.
    pub fn max_attempts(&self, method: &Method) -> u32 {
        if self.retry_methods.contains(method) {
            self.retry_count + 1
        } else {
            1
        }
    }

    /// Delay before attempt `attempt + 1`: exponential with up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.retry_backoff.is_zero() {
            return Duration::ZERO;
        }
        let base = self
            .retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_ms = rand::rng().random_range(0..=(base.as_millis() as u64 / 2));
        base + Duration::from_millis(jitter_ms)
    }
}

/// Response of a successful dispatch and the destination that produced it.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: Response<Bytes>,
    pub destination: Destination,
    pub attempts: u32,
}

/// Runs prepared requests against a cluster under a resilience policy.
#[derive(Clone)]
pub struct ResilientDispatcher {
    dispatcher: Dispatcher,
    events: Arc<dyn EventSink>,
}

impl ResilientDispatcher {
    pub fn new(dispatcher: Dispatcher, events: Arc<dyn EventSink>) -> Self {
        Self { dispatcher, events }
    }

    fn emit_transition(&self, destination: &Destination, transition: Option<BreakerTransition>) {
        if let Some(transition) = transition {
            self.events.emit(&GatewayEvent::BreakerTransition {
                cluster_id: destination.runtime.cluster_id().to_string(),
                destination_id: destination.id().to_string(),
                from: transition.from,
                to: transition.to,
            });
        }
    }

    /// Dispatch `prepared` to a destination of `cluster`.
    ///
    /// `headers` are the inbound headers, used for sticky session keys.
    pub async fn execute(
        &self,
        request_id: &str,
        cluster: &Cluster,
        policy: &ResiliencePolicy,
        prepared: &PreparedRequest,
        headers: &HeaderMap,
    ) -> Result<DispatchOutcome, GatewayError> {
        let max_attempts = policy.max_attempts(&prepared.method);
        let mut last_error: Option<GatewayError> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let selection = match cluster
                .balancer
                .select(&cluster.id, headers, &policy.breaker)
                .await
            {
                Ok(selection) => selection,
                // a retry that finds nothing left to try reports the failure that caused it
                Err(error) => return Err(last_error.unwrap_or(error)),
            };
            let destination = selection.destination().clone();

            self.events.emit(&GatewayEvent::DestinationSelected {
                request_id: request_id.to_string(),
                cluster_id: cluster.id.clone(),
                destination_id: destination.id().to_string(),
                attempt,
            });

            let Some((permit, transition)) =
                destination.runtime.breaker().try_acquire(&policy.breaker)
            else {
                return Err(GatewayError::CircuitOpen {
                    cluster_id: cluster.id.clone(),
                    destination_id: destination.id().to_string(),
                });
            };
            self.emit_transition(&destination, transition);

            let span = create_destination_span(
                &cluster.id,
                destination.id(),
                prepared.method.as_str(),
                &prepared.path_and_query,
            );
            let result = {
                let _timer = DestinationRequestTimer::new(&cluster.id, destination.id());
                tokio::time::timeout(
                    policy.timeout,
                    self.dispatcher.dispatch(&destination, prepared),
                )
                .instrument(span.clone())
                .await
            };

            let error = match result {
                Ok(Ok(response)) => {
                    let status = response.status();
                    span.record("http.status_code", status.as_u16());

                    let transition = if policy.failure_status_codes.contains(&status) {
                        increment_destination_request_total(
                            &cluster.id,
                            destination.id(),
                            "failure_status",
                        );
                        permit.record_failure()
                    } else {
                        increment_destination_request_total(&cluster.id, destination.id(), "ok");
                        permit.record_success()
                    };
                    self.emit_transition(&destination, transition);

                    if status.is_server_error() {
                        self.events.emit(&GatewayEvent::DownstreamErrorStatus {
                            request_id: request_id.to_string(),
                            cluster_id: cluster.id.clone(),
                            destination_id: destination.id().to_string(),
                            status,
                        });
                    }

                    return Ok(DispatchOutcome {
                        response,
                        destination,
                        attempts: attempt,
                    });
                }
                Ok(Err(DispatchError::InvalidRequest(reason))) => {
                    // never reached the destination; the breaker is not charged
                    drop(permit);
                    return Err(GatewayError::DownstreamProcessingFailure { reason });
                }
                Ok(Err(DispatchError::Connection(reason))) => GatewayError::ConnectionFailure {
                    destination_id: destination.id().to_string(),
                    reason,
                },
                Ok(Err(DispatchError::Processing(reason))) => {
                    GatewayError::DownstreamProcessingFailure { reason }
                }
                Err(_) => GatewayError::Timeout {
                    timeout: policy.timeout,
                },
            };

            increment_destination_request_total(&cluster.id, destination.id(), error.code());
            let transition = permit.record_failure();
            self.emit_transition(&destination, transition);
            self.events.emit(&GatewayEvent::DispatchFailed {
                request_id: request_id.to_string(),
                cluster_id: cluster.id.clone(),
                destination_id: destination.id().to_string(),
                kind: error.code(),
                detail: error.to_string(),
                attempt,
            });
            drop(selection);

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(error);
            }

            let delay = policy.backoff(attempt);
            tracing::debug!(
                "Retrying request {} on cluster {} (attempt {}/{}) after {:?}",
                request_id,
                cluster.id,
                attempt + 1,
                max_attempts,
                delay
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            last_error = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use http::Request;

    use super::*;
    use crate::{
        config::LoadBalancerConfig,
        core::{
            backend::{DestinationRuntime, DestinationUrl},
            load_balancer::LoadBalancerFactory,
        },
        ports::http_client::{DispatchResult, DownstreamClient},
    };

    /// Scripted client: refuses connections to any authority in `refused`.
    struct ScriptedClient {
        refused: Vec<String>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        status: StatusCode,
    }

    impl ScriptedClient {
        fn new(refused: &[&str]) -> Self {
            Self {
                refused: refused.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                delay: None,
                status: StatusCode::OK,
            }
        }
    }

    #[async_trait]
    impl DownstreamClient for ScriptedClient {
        async fn send(&self, req: Request<Bytes>) -> DispatchResult<Response<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let authority = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
            if self.refused.contains(&authority) {
                return Err(DispatchError::Connection("connection refused".into()));
            }
            let mut response = Response::new(Bytes::from(authority));
            *response.status_mut() = self.status;
            Ok(response)
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> DispatchResult<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<GatewayEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &GatewayEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn cluster(addresses: &[&str]) -> Cluster {
        let destinations = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| {
                Destination::new(
                    1,
                    Arc::new(DestinationRuntime::new(
                        "c",
                        format!("d{i}"),
                        DestinationUrl::new(address).unwrap(),
                    )),
                )
            })
            .collect();
        Cluster {
            id: "c".to_string(),
            balancer: Arc::new(
                LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, destinations)
                    .unwrap(),
            ),
            health_check: None,
        }
    }

    fn policy(config: ResiliencePolicyConfig) -> ResiliencePolicy {
        ResiliencePolicy::from_config("test", &config).unwrap()
    }

    fn prepared(method: Method) -> PreparedRequest {
        PreparedRequest {
            method,
            path_and_query: "/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn resilient(client: Arc<ScriptedClient>, events: Arc<Recorder>) -> ResilientDispatcher {
        ResilientDispatcher::new(Dispatcher::new(client), events)
    }

    #[tokio::test]
    async fn test_retry_lands_on_next_destination() {
        let client = Arc::new(ScriptedClient::new(&["127.0.0.1:1"]));
        let events = Arc::new(Recorder::default());
        let cluster = cluster(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
        let policy = policy(ResiliencePolicyConfig {
            retry_count: 1,
            ..ResiliencePolicyConfig::default()
        });

        let outcome = resilient(client.clone(), events.clone())
            .execute("r1", &cluster, &policy, &prepared(Method::GET), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.destination.id(), "d1");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        let recorded = events.0.lock().unwrap();
        assert!(
            recorded
                .iter()
                .any(|e| matches!(e, GatewayEvent::DispatchFailed { attempt: 1, .. }))
        );
    }

    #[tokio::test]
    async fn test_non_idempotent_method_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(&["127.0.0.1:1"]));
        let cluster = cluster(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);
        let policy = policy(ResiliencePolicyConfig {
            retry_count: 3,
            ..ResiliencePolicyConfig::default()
        });

        let result = resilient(client.clone(), Arc::new(Recorder::default()))
            .execute("r", &cluster, &policy, &prepared(Method::POST), &HeaderMap::new())
            .await;

        assert!(matches!(result, Err(GatewayError::ConnectionFailure { .. })));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_and_is_not_retried() {
        let mut client = ScriptedClient::new(&[]);
        client.delay = Some(Duration::from_millis(200));
        let client = Arc::new(client);
        let cluster = cluster(&["http://127.0.0.1:2"]);
        let policy = policy(ResiliencePolicyConfig {
            timeout: "20ms".to_string(),
            retry_count: 2,
            ..ResiliencePolicyConfig::default()
        });

        let result = resilient(client.clone(), Arc::new(Recorder::default()))
            .execute("r", &cluster, &policy, &prepared(Method::GET), &HeaderMap::new())
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let client = Arc::new(ScriptedClient::new(&["127.0.0.1:1"]));
        let events = Arc::new(Recorder::default());
        let cluster = cluster(&["http://127.0.0.1:1"]);
        let policy = policy(ResiliencePolicyConfig {
            failure_threshold: 2,
            break_duration: "10s".to_string(),
            ..ResiliencePolicyConfig::default()
        });
        let dispatcher = resilient(client.clone(), events.clone());

        for _ in 0..2 {
            let result = dispatcher
                .execute("r", &cluster, &policy, &prepared(Method::GET), &HeaderMap::new())
                .await;
            assert!(matches!(result, Err(GatewayError::ConnectionFailure { .. })));
        }

        let result = dispatcher
            .execute("r", &cluster, &policy, &prepared(Method::GET), &HeaderMap::new())
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        let recorded = events.0.lock().unwrap();
        assert!(recorded.iter().any(|e| matches!(
            e,
            GatewayEvent::BreakerTransition {
                to: crate::core::circuit_breaker::BreakerState::Open,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_server_error_passes_through_with_event() {
        let mut client = ScriptedClient::new(&[]);
        client.status = StatusCode::INTERNAL_SERVER_ERROR;
        let events = Arc::new(Recorder::default());
        let cluster = cluster(&["http://127.0.0.1:2"]);
        let policy = policy(ResiliencePolicyConfig::default());

        let outcome = resilient(Arc::new(client), events.clone())
            .execute("r", &cluster, &policy, &prepared(Method::GET), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            events
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, GatewayEvent::DownstreamErrorStatus { .. }))
        );
    }

    #[test]
    fn test_backoff_grows() {
        let policy = policy(ResiliencePolicyConfig {
            retry_backoff: "10ms".to_string(),
            ..ResiliencePolicyConfig::default()
        });
        let first = policy.backoff(1);
        let third = policy.backoff(3);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(60));
        assert_eq!(
            self::policy(ResiliencePolicyConfig::default()).backoff(1),
            Duration::ZERO
        );
    }
}
