//! Long-running certificate query service.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use certquery_core::Config;
use certquery_core::broker::{BrokerConnector, ReconnectPolicy};

use super::error::WorkerError;
use super::session::{ActiveSession, BrokerSessions, SessionEnd, SessionFactory};
use crate::storage::CertificateStore;

/// Pause after a failed lookup before taking the next delivery.
pub const DEFAULT_STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Connects to the broker and serves certificate queries until stopped.
pub struct CertificateQueryService<S> {
    sessions: BrokerSessions,
    store: Arc<S>,
    store_error_backoff: Duration,
}

impl<S: CertificateStore + 'static> CertificateQueryService<S> {
    pub fn new(config: &Config, store: Arc<S>) -> Result<Self, WorkerError> {
        let policy = ReconnectPolicy::from(&config.reconnect);
        let connector =
            BrokerConnector::new(&config.broker, policy)?.with_connection_name("certquery-worker");
        Ok(Self {
            sessions: BrokerSessions::new(connector, config.queue.clone()),
            store,
            store_error_backoff: DEFAULT_STORE_ERROR_BACKOFF,
        })
    }

    #[must_use]
    pub const fn with_store_error_backoff(mut self, backoff: Duration) -> Self {
        self.store_error_backoff = backoff;
        self
    }

    /// Serve until `shutdown` fires or a fatal error occurs.
    ///
    /// Lost connections and channels are re-established with the connector's
    /// retry policy, re-declaring the request queue each time.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let reconnect_delay = self.sessions.connector().policy().delay_for_attempt(0);
        run_sessions(
            &self.sessions,
            self.store.as_ref(),
            self.store_error_backoff,
            reconnect_delay,
            &mut shutdown,
        )
        .await
    }
}

impl<S: CertificateStore + 'static> CertificateQueryService<S> {
    /// Run the service on its own task.
    pub fn spawn(self) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        ServiceHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Open sessions from `sessions` and serve them until shutdown.
///
/// A lost session is replaced after `reconnect_delay`. Fatal errors from
/// opening a session (rejected credentials, refused queue declaration) end
/// the loop without a retry.
pub async fn run_sessions<F: SessionFactory, S: CertificateStore>(
    sessions: &F,
    store: &S,
    store_error_backoff: Duration,
    reconnect_delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    loop {
        if *shutdown.borrow() {
            info!("Certificate query service shutting down");
            return Ok(());
        }

        let reason = match sessions.open(shutdown).await {
            Ok(None) => {
                info!("Certificate query service stopped before connecting");
                return Ok(());
            }
            Ok(Some(mut session)) => {
                let end = session.run(store, store_error_backoff, shutdown).await;
                session.close().await;
                match end {
                    SessionEnd::Shutdown => {
                        info!("Certificate query service stopped");
                        return Ok(());
                    }
                    SessionEnd::Disconnected(reason) => reason,
                }
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Cannot serve certificate queries");
                return Err(e);
            }
            Err(e) => e.to_string(),
        };

        warn!(
            reason = %reason,
            delay_ms = reconnect_delay.as_millis(),
            "Broker session lost, reconnecting"
        );

        tokio::select! {
            () = sleep(reconnect_delay) => {}
            _ = shutdown.changed() => {
                info!("Certificate query service shutting down during reconnect wait");
                return Ok(());
            }
        }
    }
}

/// Handle to a spawned [`CertificateQueryService`].
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl ServiceHandle {
    /// Ask the service to stop after the delivery in progress.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the service and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.request_shutdown();
        self.task
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))?
    }

    /// Wait for the service to stop on its own.
    ///
    /// Must not be awaited again once it has returned.
    pub async fn join(&mut self) -> Result<(), WorkerError> {
        (&mut self.task)
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::Database;
    use certquery_core::broker::ConnectError;

    /// Hands out sessions that end the way the script says. Once the script
    /// runs out, sessions serve until shutdown.
    struct ScriptedSessions {
        script: Mutex<VecDeque<Result<SessionEnd, WorkerError>>>,
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedSessions {
        fn new(script: Vec<Result<SessionEnd, WorkerError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                opens: AtomicUsize::new(0),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct ScriptedSession {
        end: Option<SessionEnd>,
        closes: Arc<AtomicUsize>,
    }

    impl SessionFactory for ScriptedSessions {
        type Session = ScriptedSession;

        async fn open(
            &self,
            _shutdown: &mut watch::Receiver<bool>,
        ) -> Result<Option<ScriptedSession>, WorkerError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let end = next.transpose()?;
            Ok(Some(ScriptedSession {
                end,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    impl ActiveSession for ScriptedSession {
        async fn run<S: CertificateStore>(
            &mut self,
            _store: &S,
            _store_error_backoff: Duration,
            shutdown: &mut watch::Receiver<bool>,
        ) -> SessionEnd {
            if let Some(end) = self.end.take() {
                return end;
            }
            let _ = shutdown.changed().await;
            SessionEnd::Shutdown
        }

        async fn close(self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    const TICK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn lost_session_is_reopened() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = ScriptedSessions::new(vec![Ok(SessionEnd::Disconnected(
            "connection reset by peer".into(),
        ))]);
        let (tx, mut rx) = watch::channel(false);

        let serve = run_sessions(&sessions, &db, TICK, TICK, &mut rx);
        let stop = async {
            while sessions.opens() < 2 {
                sleep(TICK).await;
            }
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(serve, stop)
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(sessions.opens(), 2);
        assert_eq!(sessions.closes(), 2);
    }

    #[tokio::test]
    async fn channel_failure_is_retried() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = ScriptedSessions::new(vec![
            Err(WorkerError::Channel("Failed to set QoS".into())),
            Ok(SessionEnd::Shutdown),
        ]);
        let (_tx, mut rx) = watch::channel(false);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_sessions(&sessions, &db, TICK, TICK, &mut rx),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(sessions.opens(), 2);
        assert_eq!(sessions.closes(), 1);
    }

    #[tokio::test]
    async fn refused_declaration_stops_without_retry() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = ScriptedSessions::new(vec![Err(WorkerError::Declare {
            queue: "consulta_certificados".into(),
            reason: "PRECONDITION_FAILED - inequivalent arg 'x-message-ttl'".into(),
        })]);
        let (_tx, mut rx) = watch::channel(false);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_sessions(&sessions, &db, TICK, TICK, &mut rx),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(WorkerError::Declare { .. })));
        assert_eq!(sessions.opens(), 1);
        assert_eq!(sessions.closes(), 0);
    }

    #[tokio::test]
    async fn shutdown_during_reconnect_wait_returns() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions =
            ScriptedSessions::new(vec![Ok(SessionEnd::Disconnected("channel closed".into()))]);
        let (tx, mut rx) = watch::channel(false);

        let serve = run_sessions(&sessions, &db, TICK, Duration::from_secs(60), &mut rx);
        let stop = async {
            while sessions.closes() < 1 {
                sleep(TICK).await;
            }
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(serve, stop)
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(sessions.opens(), 1);
    }

    fn unreachable_config() -> Config {
        let mut config = Config::default();
        config.broker.host = "127.0.0.1".into();
        config.broker.port = 1;
        config.reconnect.initial_delay_ms = 20;
        config.reconnect.max_delay_ms = 20;
        config
    }

    #[tokio::test]
    async fn shutdown_while_broker_is_down() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let service = CertificateQueryService::new(&unreachable_config(), db).unwrap();

        let handle = service.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        let result = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_construction() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let mut config = Config::default();
        config.broker.host = String::new();

        let result = CertificateQueryService::new(&config, db);
        assert!(matches!(
            result,
            Err(WorkerError::Connect(ConnectError::InvalidUri(_)))
        ));
    }

    #[tokio::test]
    async fn run_returns_immediately_when_already_shut_down() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let service = CertificateQueryService::new(&unreachable_config(), db)
            .unwrap()
            .with_store_error_backoff(Duration::from_millis(1));

        let (_tx, rx) = watch::channel(true);
        let result = tokio::time::timeout(Duration::from_secs(1), service.run(rx))
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
