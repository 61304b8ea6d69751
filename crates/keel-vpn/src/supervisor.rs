//! Tunnel Supervisor
//!
//! Owns the connection state machine and drives each attempt through
//! resolution, the handshake, keepalive supervision and teardown.
//!
//! # Usage
//!
//! ```rust,ignore
//! let supervisor = TunnelSupervisor::new(collaborators, SessionStore::new(), Timings::default());
//! let mut events = supervisor.subscribe();
//!
//! supervisor.connect("us-east-1").await;   // -> Connecting
//! while let Ok(event) = events.recv().await {
//!     println!("#{} {}", event.sequence, event.state);
//! }
//!
//! supervisor.disconnect().await;           // -> Disconnecting
//! ```
//!
//! Commands take the state lock, apply one transition and return; the
//! slow work runs in spawned tasks that re-check the attempt epoch before
//! touching state, so a cancelled or superseded attempt can never move the
//! machine.

use crate::auth::{AuthGateway, BearerToken};
use crate::cancel::{CancelHandle, CancelToken, cancel_pair};
use crate::config::Timings;
use crate::control::SessionReporter;
use crate::directory::{DirectoryError, ServerDirectory};
use crate::resolver::{ConfigurationResolver, ResolveError};
use crate::session::{Session, SessionStatus, SessionStore};
use crate::state::{ConnectionState, FailureReason, StatusEvent, StatusFeed};
use crate::tunnel::{Connector, Link};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Buffered status events per subscriber
const FEED_CAPACITY: usize = 64;

/// External collaborators of the supervisor
pub struct Collaborators {
    pub auth: Arc<dyn AuthGateway>,
    pub directory: Arc<dyn ServerDirectory>,
    pub resolver: ConfigurationResolver,
    pub connector: Arc<dyn Connector>,
    /// Registers sessions with the control plane; failures are only logged
    pub reporter: Option<Arc<dyn SessionReporter>>,
}

struct Attempt {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

struct Active {
    link: Arc<dyn Link>,
    monitor: JoinHandle<()>,
    /// Link byte total already added to the session
    recorded: Arc<AtomicU64>,
    /// Resolves to the control plane's id for the session
    report: Option<JoinHandle<Option<String>>>,
}

struct Machine {
    state: ConnectionState,
    feed: StatusFeed,
    /// Bumped on every new attempt
    epoch: u64,
    attempt: Option<Attempt>,
    active: Option<Active>,
}

impl Machine {
    fn transition(&mut self, state: ConnectionState, reason: Option<String>) {
        info!("Tunnel state: {} -> {}", self.state, state);
        self.state = state;
        self.feed.publish(state, reason);
    }
}

enum Outcome {
    Established(Arc<dyn Link>, BearerToken),
    Failed(FailureReason, String),
    Cancelled,
}

struct Inner {
    auth: Arc<dyn AuthGateway>,
    directory: Arc<dyn ServerDirectory>,
    resolver: ConfigurationResolver,
    connector: Arc<dyn Connector>,
    reporter: Option<Arc<dyn SessionReporter>>,
    sessions: SessionStore,
    timings: Timings,
    events: broadcast::Sender<StatusEvent>,
    machine: Mutex<Machine>,
}

/// Connection state machine over one tunnel
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(collaborators: Collaborators, sessions: SessionStore, timings: Timings) -> Self {
        let feed = StatusFeed::new(FEED_CAPACITY);
        let events = feed.sender();

        Self {
            inner: Arc::new(Inner {
                auth: collaborators.auth,
                directory: collaborators.directory,
                resolver: collaborators.resolver,
                connector: collaborators.connector,
                reporter: collaborators.reporter,
                sessions,
                timings,
                events,
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    feed,
                    epoch: 0,
                    attempt: None,
                    active: None,
                }),
            }),
        }
    }

    /// Start an attempt; a no-op returning the current state unless Disconnected
    pub async fn connect(&self, server_id: &str) -> ConnectionState {
        let mut machine = self.inner.machine.lock().await;
        if machine.state != ConnectionState::Disconnected {
            debug!("connect({}) ignored while {}", server_id, machine.state);
            return machine.state;
        }

        machine.epoch += 1;
        let epoch = machine.epoch;
        machine.transition(ConnectionState::Connecting, None);

        let (cancel, token) = cancel_pair();
        let task = tokio::spawn(run_attempt(self.inner.clone(), epoch, server_id.to_string(), token));
        machine.attempt = Some(Attempt { cancel, task });

        ConnectionState::Connecting
    }

    /// Cancel an attempt or tear down a live tunnel
    pub async fn disconnect(&self) -> ConnectionState {
        let mut machine = self.inner.machine.lock().await;

        match machine.state {
            ConnectionState::Connecting => {
                let attempt = machine.attempt.take();
                if let Some(attempt) = &attempt {
                    attempt.cancel.cancel();
                }
                machine.transition(ConnectionState::Disconnecting, Some("attempt cancelled".into()));

                let inner = self.inner.clone();
                let epoch = machine.epoch;
                tokio::spawn(async move {
                    if let Some(attempt) = attempt {
                        if let Err(e) = attempt.task.await {
                            warn!("Connection attempt ended abnormally: {}", e);
                        }
                    }
                    inner.finish_disconnect(epoch).await;
                });
            }
            ConnectionState::Connected => {
                let active = machine.active.take();
                machine.transition(ConnectionState::Disconnecting, None);

                let inner = self.inner.clone();
                let epoch = machine.epoch;
                tokio::spawn(async move {
                    if let Some(active) = active {
                        active.monitor.abort();
                        inner.sample_traffic(active.link.as_ref(), &active.recorded);
                        active.link.close().await;
                        inner.report_ended(active.report);
                    }
                    match inner.sessions.retire(SessionStatus::Disconnected) {
                        Ok(closed) => inner.persist(closed).await,
                        Err(e) => error!("Teardown without an open session: {}", e),
                    }
                    inner.finish_disconnect(epoch).await;
                });
            }
            other => debug!("disconnect() ignored while {}", other),
        }

        machine.state
    }

    /// Clear a failure; a no-op in any other state
    pub async fn acknowledge(&self) -> ConnectionState {
        let mut machine = self.inner.machine.lock().await;
        if let ConnectionState::Failed(reason) = machine.state {
            debug!("Failure acknowledged ({})", reason);
            machine.transition(ConnectionState::Disconnected, None);
        }
        machine.state
    }

    /// Report traffic observed outside the link (ignored unless Connected)
    pub async fn record_traffic(&self, delta: u64) {
        let machine = self.inner.machine.lock().await;
        if machine.state.is_connected() {
            self.inner.sessions.record_bytes(delta);
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.machine.lock().await.state
    }

    /// Snapshot of the open session
    pub fn session(&self) -> Option<Session> {
        self.inner.sessions.current()
    }

    /// Sessions closed so far, oldest first
    pub fn history(&self) -> Vec<Session> {
        self.inner.sessions.history()
    }

    /// Subscribe to state transitions from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Bring the supervisor to rest and wait for `Disconnected`
    pub async fn shutdown(&self) {
        let mut events = self.subscribe();

        match self.disconnect().await {
            ConnectionState::Failed(_) => {
                self.acknowledge().await;
            }
            ConnectionState::Disconnected => {}
            _ => loop {
                if self.state().await == ConnectionState::Disconnected {
                    break;
                }
                match events.recv().await {
                    Ok(event) if event.state == ConnectionState::Disconnected => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            },
        }
        info!("Supervisor shut down");
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        if let Ok(mut machine) = self.inner.machine.try_lock() {
            if let Some(attempt) = machine.attempt.take() {
                attempt.cancel.cancel();
                attempt.task.abort();
            }
            if let Some(active) = machine.active.take() {
                active.monitor.abort();
            }
        }
    }
}

impl Inner {
    async fn finish_disconnect(&self, epoch: u64) {
        let mut machine = self.machine.lock().await;
        if machine.epoch == epoch && machine.state == ConnectionState::Disconnecting {
            machine.transition(ConnectionState::Disconnected, None);
        }
    }

    async fn establish(&self, server_id: &str, cancel: &CancelToken) -> Outcome {
        let lookup = match cancel.run(self.directory.find(server_id)).await {
            None => return Outcome::Cancelled,
            Some(lookup) => lookup,
        };
        let server = match lookup {
            Ok(Some(server)) => server,
            Ok(None) => {
                return Outcome::Failed(FailureReason::UnknownServer, format!("no server with id {}", server_id));
            }
            Err(DirectoryError::Unauthorized) => {
                return Outcome::Failed(
                    FailureReason::Unauthorized,
                    "server list refused the token; refresh the token and reconnect".into(),
                );
            }
            Err(e) => return Outcome::Failed(FailureReason::ServerUnreachable, e.to_string()),
        };

        let token = match cancel.run(self.auth.acquire_token()).await {
            None => return Outcome::Cancelled,
            Some(Ok(token)) => token,
            Some(Err(e)) => {
                return Outcome::Failed(
                    FailureReason::Unauthorized,
                    format!("{}; refresh the token and reconnect", e),
                );
            }
        };

        let config = match self.resolver.resolve(&server, &token, cancel).await {
            Ok(config) => config,
            Err(ResolveError::Cancelled) => return Outcome::Cancelled,
            Err(e) => return Outcome::Failed(FailureReason::from(&e), e.to_string()),
        };

        info!("Handshake with {} at {}", server.id, config.endpoint());
        let handshake = self.connector.establish(config, self.timings.handshake_timeout);
        match cancel.run(handshake).await {
            None => Outcome::Cancelled,
            Some(Ok(link)) => Outcome::Established(link, token),
            Some(Err(e)) => Outcome::Failed(FailureReason::from(&e), e.to_string()),
        }
    }

    async fn link_lost(&self, epoch: u64, misses: u32) {
        let (closed, report) = {
            let mut machine = self.machine.lock().await;
            if machine.epoch != epoch || machine.state != ConnectionState::Connected {
                return;
            }

            let active = machine.active.take();
            if let Some(active) = &active {
                self.sample_traffic(active.link.as_ref(), &active.recorded);
                active.link.close().await;
            }
            let closed = self.sessions.retire(SessionStatus::Failed(FailureReason::LinkLost));

            error!("Link lost after {} missed keepalives", misses);
            machine.transition(
                ConnectionState::Failed(FailureReason::LinkLost),
                Some(format!("{} consecutive keepalives missed", misses)),
            );
            (closed, active.and_then(|a| a.report))
        };

        self.report_ended(report);
        match closed {
            Ok(session) => self.persist(session).await,
            Err(e) => error!("Link lost without an open session: {}", e),
        }
    }

    /// Add link traffic not yet counted to the open session
    fn sample_traffic(&self, link: &dyn Link, recorded: &AtomicU64) {
        let total = link.stats().bytes_transferred();
        let previous = recorded.fetch_max(total, Ordering::AcqRel);
        self.sessions.record_bytes(total.saturating_sub(previous));
    }

    /// Append a closed session to the log off the async workers
    async fn persist(&self, session: Session) {
        let Some(log) = self.sessions.log().cloned() else {
            return;
        };
        let id = session.id;
        match tokio::task::spawn_blocking(move || log.append(&session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not persist session {}: {}", id, e),
            Err(e) => warn!("Session log task for {} failed: {}", id, e),
        }
    }

    fn report_started(&self, server_id: &str, token: BearerToken) -> Option<JoinHandle<Option<String>>> {
        let reporter = self.reporter.clone()?;
        let server_id = server_id.to_string();

        Some(tokio::spawn(async move {
            match reporter.session_started(&server_id, &token).await {
                Ok(remote) => {
                    debug!("Session registered with control plane as {}", remote);
                    Some(remote)
                }
                Err(e) => {
                    warn!("Could not register session with control plane: {}", e);
                    None
                }
            }
        }))
    }

    fn report_ended(&self, report: Option<JoinHandle<Option<String>>>) {
        let (Some(reporter), Some(report)) = (self.reporter.clone(), report) else {
            return;
        };
        let auth = self.auth.clone();

        tokio::spawn(async move {
            let remote = match report.await {
                Ok(Some(remote)) => remote,
                _ => return,
            };
            let result = match auth.acquire_token().await {
                Ok(token) => reporter.session_ended(&remote, &token).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = result {
                warn!("Could not end registered session {}: {}", remote, e);
            }
        });
    }
}

async fn run_attempt(inner: Arc<Inner>, epoch: u64, server_id: String, cancel: CancelToken) {
    let outcome = inner.establish(&server_id, &cancel).await;

    let mut machine = inner.machine.lock().await;
    let current = machine.epoch == epoch && machine.state == ConnectionState::Connecting && !cancel.is_cancelled();
    if !current {
        debug!("Discarding result of stale attempt {}", epoch);
        if let Outcome::Established(link, _) = outcome {
            link.close().await;
        }
        return;
    }
    machine.attempt = None;

    match outcome {
        Outcome::Established(link, token) => match inner.sessions.open(&inner.auth.user_id(), &server_id) {
            Ok(session) => {
                let recorded = Arc::new(AtomicU64::new(0));
                let monitor = tokio::spawn(monitor(inner.clone(), epoch, link.clone(), recorded.clone()));
                let report = inner.report_started(&server_id, token);
                machine.active = Some(Active {
                    link,
                    monitor,
                    recorded,
                    report,
                });
                info!("Connected to {} (session {})", server_id, session.id);
                machine.transition(ConnectionState::Connected, None);
            }
            Err(e) => {
                error!("Could not open session: {}", e);
                link.close().await;
                machine.transition(ConnectionState::Failed(FailureReason::ProtocolError), Some(e.to_string()));
            }
        },
        Outcome::Failed(reason, detail) => {
            warn!("Connection to {} failed: {}", server_id, detail);
            machine.transition(ConnectionState::Failed(reason), Some(detail));
        }
        // the cancel flag is checked above
        Outcome::Cancelled => {}
    }
}

/// Keepalive loop for one live link
async fn monitor(inner: Arc<Inner>, epoch: u64, link: Arc<dyn Link>, recorded: Arc<AtomicU64>) {
    let timings = inner.timings;
    let threshold = timings.keepalive_misses.max(1);
    let mut ticker = tokio::time::interval_at(Instant::now() + timings.keepalive_interval, timings.keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut misses = 0u32;

    loop {
        ticker.tick().await;
        let result = link.keepalive(timings.handshake_timeout).await;
        inner.sample_traffic(link.as_ref(), &recorded);

        match result {
            Ok(()) => {
                if misses > 0 {
                    debug!("Keepalive answered after {} misses", misses);
                }
                misses = 0;
            }
            Err(e) => {
                misses += 1;
                warn!("Keepalive missed ({}/{}): {}", misses, threshold, e);
                if misses >= threshold {
                    break;
                }
            }
        }
    }

    inner.link_lost(epoch, misses).await;
}
