//! Broker connector with cancellable, unbounded retry.

use std::fmt::Display;
use std::future::Future;

use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::BrokerConfig;

use super::config::ReconnectPolicy;
use super::error::ConnectError;

/// How a failed connection attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFault {
    /// Broker unreachable, refused, or dropped the socket. Retried forever.
    Unavailable,
    /// Broker answered and refused us. Retried a bounded number of times.
    Rejected,
}

impl ConnectFault {
    /// Classify a lapin connection error.
    pub const fn classify(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(_) => Self::Rejected,
            _ => Self::Unavailable,
        }
    }
}

/// Opens connections to the message broker.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    uri: AMQPUri,
    addr: String,
    connection_name: String,
    policy: ReconnectPolicy,
}

impl BrokerConnector {
    /// Build a connector; an unusable endpoint is rejected here rather
    /// than retried.
    pub fn new(broker: &BrokerConfig, policy: ReconnectPolicy) -> Result<Self, ConnectError> {
        if broker.host.trim().is_empty() {
            return Err(ConnectError::InvalidUri("broker host is empty".into()));
        }
        if broker.port == 0 {
            return Err(ConnectError::InvalidUri("broker port is 0".into()));
        }
        let uri = broker.amqp_uri();
        Ok(Self {
            uri,
            addr: broker.display_addr(),
            connection_name: "certquery".to_string(),
            policy,
        })
    }

    /// Name reported to the broker's management UI.
    #[must_use]
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Connect, retrying until the broker accepts us.
    ///
    /// Returns `Ok(None)` if `shutdown` fires first.
    pub async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Connection>, ConnectError> {
        info!(addr = %self.addr, "Connecting to broker");
        let connection = retry_connect(
            &self.policy,
            shutdown,
            || {
                Connection::connect_uri(
                    self.uri.clone(),
                    ConnectionProperties::default()
                        .with_connection_name(self.connection_name.clone().into()),
                )
            },
            ConnectFault::classify,
        )
        .await?;
        if connection.is_some() {
            info!(addr = %self.addr, "Connected to broker");
        }
        Ok(connection)
    }
}

/// Drive `attempt` until it succeeds, sleeping per `policy` between tries.
///
/// Unavailable faults are retried without limit. Rejected faults end the
/// loop after `policy.max_rejected_attempts` consecutive occurrences. Both
/// the attempt and the wait are abandoned as soon as `shutdown` changes,
/// in which case `Ok(None)` is returned.
pub async fn retry_connect<T, E, F, Fut>(
    policy: &ReconnectPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut attempt: F,
    classify: impl Fn(&E) -> ConnectFault,
) -> Result<Option<T>, ConnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures: u32 = 0;
    let mut rejected: u32 = 0;

    loop {
        if *shutdown.borrow() {
            info!("Shutdown requested before broker connection was established");
            return Ok(None);
        }

        let outcome = tokio::select! {
            result = timeout(policy.attempt_timeout, attempt()) => result,
            _ = shutdown.changed() => {
                info!("Shutdown requested during broker connection attempt");
                return Ok(None);
            }
        };

        let delay = policy.delay_for_attempt(failures);
        match outcome {
            Ok(Ok(connection)) => {
                if failures > 0 {
                    info!(attempts = failures + 1, "Broker connection recovered");
                }
                return Ok(Some(connection));
            }
            Ok(Err(e)) => match classify(&e) {
                ConnectFault::Unavailable => {
                    rejected = 0;
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        "Broker unavailable, retrying"
                    );
                }
                ConnectFault::Rejected => {
                    rejected += 1;
                    if !policy.should_retry_rejected(rejected) {
                        error!(error = %e, attempts = rejected, "Broker rejected connection");
                        return Err(ConnectError::Rejected {
                            attempts: rejected,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        error = %e,
                        attempt = rejected,
                        delay_ms = delay.as_millis(),
                        "Broker rejected connection, retrying"
                    );
                }
            },
            Err(_) => {
                rejected = 0;
                warn!(
                    timeout_ms = policy.attempt_timeout.as_millis(),
                    delay_ms = delay.as_millis(),
                    "Broker connection attempt timed out, retrying"
                );
            }
        }

        tokio::select! {
            () = sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("Shutdown requested during reconnect wait");
                return Ok(None);
            }
        }

        failures = failures.saturating_add(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    enum FakeError {
        Down,
        Denied,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Down => f.write_str("connection refused"),
                Self::Denied => f.write_str("ACCESS_REFUSED"),
            }
        }
    }

    const fn classify(e: &FakeError) -> ConnectFault {
        match e {
            FakeError::Down => ConnectFault::Unavailable,
            FakeError::Denied => ConnectFault::Rejected,
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy::fixed(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn retries_until_broker_comes_back() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = retry_connect(
            &fast_policy(),
            &mut rx,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n < 4 { Err(FakeError::Down) } else { Ok(n) } }
            },
            classify,
        )
        .await
        .unwrap();

        assert_eq!(result, Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn resumes_within_one_interval_of_recovery() {
        let (_tx, mut rx) = watch::channel(false);
        let interval = Duration::from_millis(50);
        let started = Instant::now();
        let up_at = started + Duration::from_millis(120);

        let result = retry_connect(
            &ReconnectPolicy::fixed(interval),
            &mut rx,
            || async move {
                if Instant::now() >= up_at {
                    Ok(())
                } else {
                    Err(FakeError::Down)
                }
            },
            classify,
        )
        .await
        .unwrap();

        assert!(result.is_some());
        // Connected no later than one retry interval (plus scheduling slack)
        // after the broker became reachable.
        assert!(started.elapsed() < Duration::from_millis(120) + interval * 3);
    }

    #[tokio::test]
    async fn rejection_becomes_fatal_after_limit() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let err = retry_connect(
            &fast_policy(),
            &mut rx,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FakeError::Denied) }
            },
            classify,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectError::Rejected { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unavailable_resets_rejection_count() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        // denied, denied, down, denied, denied, ok
        let counter = Arc::clone(&calls);
        let result = retry_connect(
            &fast_policy(),
            &mut rx,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        2 => Err(FakeError::Down),
                        5 => Ok(n),
                        _ => Err(FakeError::Denied),
                    }
                }
            },
            classify,
        )
        .await
        .unwrap();

        assert_eq!(result, Some(5));
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_wait() {
        let (tx, mut rx) = watch::channel(false);
        let policy = ReconnectPolicy::fixed(Duration::from_secs(3600));

        let handle = tokio::spawn(async move {
            retry_connect(
                &policy,
                &mut rx,
                || async { Err::<(), _>(FakeError::Down) },
                classify,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn shutdown_before_first_attempt_skips_connecting() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = retry_connect(
            &fast_policy(),
            &mut rx,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, FakeError>(()) }
            },
            classify,
        )
        .await
        .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hung_attempt_times_out_and_retries() {
        let (_tx, mut rx) = watch::channel(false);
        let policy = ReconnectPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = retry_connect(
            &policy,
            &mut rx,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        std::future::pending::<()>().await;
                    }
                    Ok::<_, FakeError>(n)
                }
            },
            classify,
        )
        .await
        .unwrap();

        assert_eq!(result, Some(1));
    }

    #[test]
    fn invalid_endpoint_is_rejected_up_front() {
        let broker = BrokerConfig {
            port: 5672,
            host: String::new(),
            ..Default::default()
        };
        let result = BrokerConnector::new(&broker, ReconnectPolicy::default());
        assert!(matches!(result, Err(ConnectError::InvalidUri(_))));
    }

    #[test]
    fn zero_port_is_rejected_up_front() {
        let broker = BrokerConfig {
            port: 0,
            ..Default::default()
        };
        let result = BrokerConnector::new(&broker, ReconnectPolicy::default());
        assert!(matches!(result, Err(ConnectError::InvalidUri(_))));
    }

    #[test]
    fn default_endpoint_builds_connector() {
        let connector =
            BrokerConnector::new(&BrokerConfig::default(), ReconnectPolicy::default()).unwrap();
        assert_eq!(connector.policy().initial_delay, Duration::from_secs(5));
    }
}
