use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::auth::{usable_token, CredentialStore};
use crate::config::ConnectionConfig;
use crate::dispatcher::{Event, EventDispatcher};
use crate::metrics::{ConnectionMetrics, DispatchMetrics};
use crate::transport::{ExponentialBackoff, Transport, TransportError, TransportSession};

use super::{ConnectionSignal, ConnectionState};

/// Upper bound for a graceful session close or driver shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the lifecycle signal channel
const SIGNAL_CAPACITY: usize = 64;

/// Owns the single logical push connection.
///
/// A spawned driver task performs handshakes, pumps inbound frames into the
/// [`EventDispatcher`] and reconnects with exponential backoff. Subscriptions
/// live in the dispatcher, so they survive any number of physical sessions.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<EventDispatcher>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<ConnectionSignal>,
}

/// Handle to a running driver task
struct Driver {
    handle: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
    retry_now: Arc<Notify>,
}

impl Driver {
    async fn stop(mut self) {
        let _ = self.shutdown.send(());
        if timeout(STOP_TIMEOUT, &mut self.handle).await.is_err() {
            tracing::warn!("Connection driver did not stop in time, aborting");
            self.handle.abort();
        }
    }
}

enum HandshakeFailure {
    /// Terminal for the current credential
    Auth(String),
    Transient(TransportError),
}

enum SessionEnd {
    Shutdown,
    AuthRevoked(String),
    Dropped(String),
}

enum Step {
    Shutdown,
    Frame(Option<Result<String, TransportError>>),
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        config: ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                transport,
                credentials,
                dispatcher,
                config,
                state,
                signals,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Start the connection if it is not already up.
    ///
    /// Resolves once the first handshake attempt has settled and returns the
    /// resulting state. Failures are reported through state and
    /// [`signals`](Self::signals), never as an error. While a reconnect is
    /// pending, the backoff wait is cut short instead.
    #[tracing::instrument(
        name = "connection.connect",
        skip(self),
        fields(transport = self.shared.transport.name())
    )]
    pub async fn connect(&self) -> ConnectionState {
        let mut state_rx = self.shared.state.subscribe();

        {
            let mut driver = self.driver.lock().await;
            let current = *self.shared.state.borrow();

            match current {
                ConnectionState::Connected => return current,
                ConnectionState::Reconnecting { attempt } => {
                    if let Some(driver) = driver.as_ref() {
                        tracing::debug!(attempt = attempt, "Expediting pending reconnect");
                        driver.retry_now.notify_waiters();
                    }
                    return current;
                }
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    // A driver that gave up (auth failure, retries exhausted) has
                    // already finished; reap it before starting a new one.
                    if let Some(finished) = driver.take() {
                        finished.stop().await;
                    }
                    self.shared.set_state(ConnectionState::Connecting);
                    *driver = Some(self.spawn_driver());
                }
            }
        }

        let settled = state_rx
            .wait_for(|s| !matches!(s, ConnectionState::Connecting))
            .await
            .map(|s| *s);

        settled.unwrap_or_else(|_| self.state())
    }

    /// Tear the connection down. Safe to call repeatedly or when never connected.
    #[tracing::instrument(name = "connection.disconnect", skip(self))]
    pub async fn disconnect(&self) {
        let mut driver = self.driver.lock().await;
        if let Some(running) = driver.take() {
            running.stop().await;
        }

        let previous = self.shared.set_state(ConnectionState::Disconnected);
        if previous.is_active() {
            tracing::info!(previous = %previous, "Push connection closed");
            self.shared.emit(ConnectionSignal::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.shared.signals.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.shared.dispatcher
    }

    fn spawn_driver(&self) -> Driver {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let retry_now = Arc::new(Notify::new());
        let handle = tokio::spawn(
            self.shared
                .clone()
                .run(shutdown_rx, retry_now.clone()),
        );

        Driver {
            handle,
            shutdown,
            retry_now,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.handle.abort();
        }
    }
}

impl Shared {
    /// Driver loop: handshake, pump, back off, repeat until told to stop or a
    /// terminal condition is reached.
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>, retry_now: Arc<Notify>) {
        let mut backoff = ExponentialBackoff::with_config(self.config.backoff());
        let max_attempts = self.config.max_reconnect_attempts;
        let mut failures: u32 = 0;

        loop {
            let handshake = tokio::select! {
                _ = shutdown.recv() => return,
                result = self.handshake() => result,
            };

            match handshake {
                Ok(session) => {
                    backoff.reset();
                    failures = 0;

                    let session_id = Uuid::new_v4();
                    ConnectionMetrics::record_handshake_ok();
                    self.set_state(ConnectionState::Connected);
                    self.emit(ConnectionSignal::Connected { session_id });
                    tracing::info!(
                        session_id = %session_id,
                        transport = self.transport.name(),
                        "Push connection established"
                    );

                    match self.pump(session, &mut shutdown).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::AuthRevoked(reason) => {
                            self.fail_auth(reason);
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            ConnectionMetrics::record_session_dropped();
                            tracing::warn!(
                                session_id = %session_id,
                                reason = %reason,
                                "Push connection dropped, reconnecting"
                            );
                            self.emit(ConnectionSignal::Dropped(reason));
                        }
                    }
                }
                Err(HandshakeFailure::Auth(reason)) => {
                    ConnectionMetrics::record_handshake_auth_rejected();
                    self.fail_auth(reason);
                    return;
                }
                Err(HandshakeFailure::Transient(error)) => {
                    ConnectionMetrics::record_handshake_transient();
                    failures += 1;
                    tracing::warn!(
                        attempt = failures,
                        error = %error,
                        "Push handshake failed"
                    );
                    self.emit(ConnectionSignal::ConnectError(error.to_string()));

                    if max_attempts > 0 && failures >= max_attempts {
                        tracing::error!(
                            attempts = failures,
                            "Giving up on push connection after consecutive failures"
                        );
                        self.set_state(ConnectionState::Disconnected);
                        self.emit(ConnectionSignal::RetriesExhausted { attempts: failures });
                        return;
                    }
                }
            }

            // Registered before the state flips so an expedite issued after
            // `connect()` observes Reconnecting is never missed. Only this wait
            // can be cut short; nothing carries over to the next one.
            let expedite = retry_now.notified();
            tokio::pin!(expedite);

            self.set_state(ConnectionState::Reconnecting {
                attempt: failures + 1,
            });
            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = &mut expedite => {
                    tracing::debug!("Reconnect expedited");
                }
            }
        }
    }

    /// One bounded handshake with the credential as it is right now
    async fn handshake(&self) -> Result<Box<dyn TransportSession>, HandshakeFailure> {
        let token = usable_token(self.credentials.as_ref())
            .map_err(|problem| HandshakeFailure::Auth(problem.to_string()))?;

        match timeout(self.config.handshake_timeout(), self.transport.open(&token)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) if e.is_auth() => Err(HandshakeFailure::Auth(e.to_string())),
            Ok(Err(e)) => Err(HandshakeFailure::Transient(e)),
            Err(_) => Err(HandshakeFailure::Transient(TransportError::Timeout)),
        }
    }

    /// Read frames until the session ends. Dispatch happens inline, in receive order.
    async fn pump(
        &self,
        mut session: Box<dyn TransportSession>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let idle = self.config.idle_timeout();

        loop {
            let step = tokio::select! {
                _ = shutdown.recv() => Step::Shutdown,
                next = next_frame_within(session.as_mut(), idle) => Step::Frame(next),
            };

            match step {
                Step::Shutdown => {
                    if timeout(STOP_TIMEOUT, session.close()).await.is_err() {
                        tracing::debug!("Session close timed out");
                    }
                    return SessionEnd::Shutdown;
                }
                Step::Frame(Some(Ok(frame))) => self.deliver(&frame),
                Step::Frame(Some(Err(e))) if e.is_auth() => {
                    return SessionEnd::AuthRevoked(e.to_string());
                }
                Step::Frame(Some(Err(e))) => return SessionEnd::Dropped(e.to_string()),
                Step::Frame(None) => return SessionEnd::Dropped("closed by server".to_string()),
            }
        }
    }

    fn deliver(&self, frame: &str) {
        let event = match Event::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                DispatchMetrics::record_malformed_frame();
                tracing::debug!(error = %e, len = frame.len(), "Dropping malformed frame");
                return;
            }
        };

        if event.is_keepalive() {
            return;
        }

        let report = self.dispatcher.dispatch(&event);
        tracing::trace!(
            event = %event.name,
            delivered = report.delivered,
            failed = report.failed,
            "Event dispatched"
        );
    }

    fn fail_auth(&self, reason: String) {
        tracing::warn!(reason = %reason, "Push credential rejected, not retrying");
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionSignal::AuthFailed(reason));
    }

    /// Returns the previous state
    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionMetrics::set_state(state.metric_code());
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
        previous
    }

    fn emit(&self, signal: ConnectionSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }
}

async fn next_frame_within(
    session: &mut dyn TransportSession,
    idle: Option<Duration>,
) -> Option<Result<String, TransportError>> {
    match idle {
        Some(limit) => timeout(limit, session.next_frame())
            .await
            .unwrap_or(Some(Err(TransportError::Timeout))),
        None => session.next_frame().await,
    }
}
