//! Plugin session state machine
//!
//! One dispatch loop owns the [`SessionState`]. The connect/run sequence
//! runs on its own task and reports progress over a channel, as do signal
//! watchers and backoff timers; every message goes through [`transition`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use snapquota_core::config::SessionConfig;
use snapquota_core::{Error, LifecycleEvent, Result};
use snapquota_prjquota::QuotaBackend;

use crate::coordinator::LifecycleHandler;
use crate::runtime::RuntimeConnector;

/// Identity the plugin registers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Plugin name
    pub name: String,
    /// Two-digit ordering index
    pub index: String,
    /// Subscribed event kinds
    pub events: Vec<String>,
}

impl Registration {
    /// Validate and build a registration for every lifecycle event
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty name or an index that is
    /// not two digits
    pub fn new(name: impl Into<String>, index: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let index = index.into();
        if name.trim().is_empty() {
            return Err(Error::config("plugin name cannot be empty"));
        }
        if index.len() != 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::config(format!(
                "plugin index must be two digits, got {index:?}"
            )));
        }
        Ok(Self {
            name,
            index,
            events: LifecycleEvent::ALL.iter().map(ToString::to_string).collect(),
        })
    }
}

/// An established, registered session with the host runtime
#[async_trait]
pub trait HostSession: Send {
    /// Deliver events to `handler` until the host closes the session
    ///
    /// # Errors
    /// Returns [`Error::Session`] if the connection fails
    async fn run(self: Box<Self>, handler: Arc<dyn LifecycleHandler>) -> Result<()>;
}

/// Opens sessions with the host runtime
#[async_trait]
pub trait HostConnector: Send + Sync {
    /// Connect and register
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] is fatal; any other error is retried
    async fn connect(&self, registration: &Registration) -> Result<Box<dyn HostSession>>;
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; waiting to (re)connect
    Disconnected,
    /// Connecting to the runtime and registering
    Connecting,
    /// Registered with the host
    Registered,
    /// Host event loop running
    Running,
    /// Stopping before exit
    Closing,
    /// Stopped for good
    Terminated,
}

/// Messages driving the state machine
///
/// Messages from connect tasks and backoff timers carry the generation they
/// were started for; anything from an older generation is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The loop was started
    Start,
    /// Registration succeeded
    Registered {
        /// Connect attempt
        generation: u64,
    },
    /// The host event loop started
    Running {
        /// Connect attempt
        generation: u64,
    },
    /// The session ended, cleanly or with an error
    Closed {
        /// Connect attempt
        generation: u64,
        /// Why it ended
        error: Option<String>,
    },
    /// The session failed in a way retrying cannot fix
    Fatal {
        /// Connect attempt
        generation: u64,
        /// What went wrong
        message: String,
    },
    /// The restart delay expired
    BackoffElapsed {
        /// Connect attempt the delay followed
        generation: u64,
    },
    /// Operator asked for a reconnect (`SIGHUP`)
    Restart,
    /// Operator asked for shutdown (`SIGINT`, `SIGTERM`, `SIGQUIT`)
    Shutdown,
    /// The current session was stopped
    Stopped,
}

impl SessionEvent {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::Registered { generation }
            | Self::Running { generation }
            | Self::Closed { generation, .. }
            | Self::Fatal { generation, .. }
            | Self::BackoffElapsed { generation } => Some(*generation),
            Self::Start | Self::Restart | Self::Shutdown | Self::Stopped => None,
        }
    }
}

/// Side effect the dispatch loop performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do
    None,
    /// Spawn a new connect/run task
    Connect,
    /// Stop the current task and schedule a reconnect
    Backoff,
    /// Stop the current task before terminating
    Stop,
    /// Stop the current task and fail
    Fail,
}

/// The transition table
#[must_use]
pub fn transition(state: SessionState, event: &SessionEvent) -> (SessionState, Action) {
    use SessionState as S;

    match (state, event) {
        (S::Terminated, _) => (S::Terminated, Action::None),
        (S::Closing, SessionEvent::Stopped) => (S::Terminated, Action::None),
        (S::Closing, _) => (S::Closing, Action::None),
        (_, SessionEvent::Shutdown) => (S::Closing, Action::Stop),
        (_, SessionEvent::Fatal { .. }) => (S::Terminated, Action::Fail),

        (
            S::Disconnected,
            SessionEvent::Start | SessionEvent::BackoffElapsed { .. } | SessionEvent::Restart,
        ) => (S::Connecting, Action::Connect),

        (S::Connecting, SessionEvent::Registered { .. }) => (S::Registered, Action::None),
        (S::Registered, SessionEvent::Running { .. }) => (S::Running, Action::None),

        (
            S::Connecting | S::Registered | S::Running,
            SessionEvent::Closed { .. } | SessionEvent::Restart,
        ) => (S::Disconnected, Action::Backoff),

        (state, _) => (state, Action::None),
    }
}

/// Handle for asking a running session to restart or stop
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionControl {
    /// Drop the current session and reconnect
    ///
    /// # Errors
    /// Returns [`Error::ChannelSend`] if the session has finished
    pub async fn restart(&self) -> Result<()> {
        self.tx.send(SessionEvent::Restart).await?;
        Ok(())
    }

    /// Stop the session and end [`PluginSession::run`]
    ///
    /// # Errors
    /// Returns [`Error::ChannelSend`] if the session has finished
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(SessionEvent::Shutdown).await?;
        Ok(())
    }
}

/// Keeps the plugin registered with the host runtime
pub struct PluginSession {
    registration: Registration,
    config: SessionConfig,
    host: Arc<dyn HostConnector>,
    runtime: Arc<dyn RuntimeConnector>,
    handler: Arc<dyn LifecycleHandler>,
    tx: mpsc::Sender<SessionEvent>,
    rx: mpsc::Receiver<SessionEvent>,
}

impl PluginSession {
    /// Create a session
    #[must_use]
    pub fn new(
        registration: Registration,
        config: SessionConfig,
        host: Arc<dyn HostConnector>,
        runtime: Arc<dyn RuntimeConnector>,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            registration,
            config,
            host,
            runtime,
            handler,
            tx,
            rx,
        }
    }

    /// Handle for restart and shutdown requests
    #[must_use]
    pub fn control(&self) -> SessionControl {
        SessionControl {
            tx: self.tx.clone(),
        }
    }

    /// Check quota support, then keep a session alive until shutdown
    ///
    /// # Errors
    /// Returns [`Error::QuotaUnsupported`] if the base path has no project
    /// quota, and [`Error::Session`] on fatal session errors or when the
    /// restart limit is exceeded
    pub async fn run(self, backend: &dyn QuotaBackend, base_path: &std::path::Path) -> Result<()> {
        if !backend.precheck(base_path).await? {
            return Err(Error::QuotaUnsupported {
                path: base_path.to_path_buf(),
            });
        }
        self.dispatch().await
    }

    /// The dispatch loop, without the quota precheck
    ///
    /// # Errors
    /// See [`PluginSession::run`]
    pub async fn dispatch(mut self) -> Result<()> {
        let mut state = SessionState::Disconnected;
        let mut generation = 0u64;
        let mut restarts = 0u32;
        let mut task: Option<JoinHandle<()>> = None;
        let mut pending = Some(SessionEvent::Start);

        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match self.rx.recv().await {
                    Some(event) => event,
                    None => return Err(Error::session("session channel closed")),
                },
            };

            if event.generation().is_some_and(|g| g != generation) {
                debug!(?event, generation, "Dropping stale session event");
                continue;
            }

            let (next, action) = transition(state, &event);
            if next != state {
                info!(from = ?state, to = ?next, ?event, "Session transition");
            }
            state = next;
            if state == SessionState::Running {
                restarts = 0;
            }

            match action {
                Action::None => {}
                Action::Connect => {
                    generation += 1;
                    task = Some(self.spawn_connect(generation));
                }
                Action::Backoff => {
                    stop(task.take());
                    restarts = restarts.saturating_add(1);
                    if let Some(max) = self.config.max_restarts {
                        if restarts > max {
                            error!(restarts, max, "Restart limit exceeded");
                            return Err(Error::session(format!(
                                "giving up after {max} restarts"
                            )));
                        }
                    }
                    info!(delay = ?self.config.restart_delay, restarts, "Restarting plugin");
                    self.spawn_backoff(generation);
                }
                Action::Stop => {
                    info!("Stopping plugin");
                    stop(task.take());
                    pending = Some(SessionEvent::Stopped);
                }
                Action::Fail => {
                    stop(task.take());
                    let message = match event {
                        SessionEvent::Fatal { message, .. } => message,
                        other => format!("{other:?}"),
                    };
                    return Err(Error::session(message));
                }
            }

            if state == SessionState::Terminated {
                info!("Plugin session terminated");
                return Ok(());
            }
        }
    }

    fn spawn_connect(&self, generation: u64) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let host = Arc::clone(&self.host);
        let runtime = Arc::clone(&self.runtime);
        let handler = Arc::clone(&self.handler);
        let registration = self.registration.clone();

        tokio::spawn(async move {
            let result: Result<()> = async {
                let client = runtime.connect().await?;
                handler.runtime_connected(client).await;

                let session = host.connect(&registration).await?;
                tx.send(SessionEvent::Registered { generation }).await?;
                tx.send(SessionEvent::Running { generation }).await?;

                session.run(Arc::clone(&handler)).await
            }
            .await;

            let event = match result {
                Ok(()) => SessionEvent::Closed {
                    generation,
                    error: None,
                },
                Err(e @ Error::InvalidConfig { .. }) => {
                    error!(error = %e, "Failed to create plugin session");
                    SessionEvent::Fatal {
                        generation,
                        message: e.to_string(),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Plugin session ended with error");
                    SessionEvent::Closed {
                        generation,
                        error: Some(e.to_string()),
                    }
                }
            };
            if tx.send(event).await.is_err() {
                debug!("Session loop is gone");
            }
        })
    }

    fn spawn_backoff(&self, generation: u64) {
        let tx = self.tx.clone();
        let delay: Duration = self.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::BackoffElapsed { generation }).await;
        });
    }
}

fn stop(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

impl std::fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSession")
            .field("registration", &self.registration)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState as S;

    fn closed(generation: u64) -> SessionEvent {
        SessionEvent::Closed {
            generation,
            error: None,
        }
    }

    #[test]
    fn test_registration_validation() {
        assert!(Registration::new("quota-injector", "99").is_ok());
        assert!(Registration::new("", "99").is_err());
        assert!(Registration::new("quota-injector", "9").is_err());
        assert!(Registration::new("quota-injector", "ab").is_err());

        let registration = Registration::new("quota-injector", "10").unwrap();
        assert_eq!(registration.events.len(), 3);
    }

    #[test]
    fn test_happy_path() {
        let (s, a) = transition(S::Disconnected, &SessionEvent::Start);
        assert_eq!((s, a), (S::Connecting, Action::Connect));
        let (s, _) = transition(s, &SessionEvent::Registered { generation: 1 });
        assert_eq!(s, S::Registered);
        let (s, _) = transition(s, &SessionEvent::Running { generation: 1 });
        assert_eq!(s, S::Running);
    }

    #[test]
    fn test_close_and_restart_back_off() {
        for state in [S::Connecting, S::Registered, S::Running] {
            assert_eq!(
                transition(state, &closed(1)),
                (S::Disconnected, Action::Backoff)
            );
            assert_eq!(
                transition(state, &SessionEvent::Restart),
                (S::Disconnected, Action::Backoff)
            );
        }
        assert_eq!(
            transition(S::Disconnected, &SessionEvent::BackoffElapsed { generation: 1 }),
            (S::Connecting, Action::Connect)
        );
    }

    #[test]
    fn test_shutdown_from_anywhere() {
        for state in [S::Disconnected, S::Connecting, S::Registered, S::Running] {
            assert_eq!(
                transition(state, &SessionEvent::Shutdown),
                (S::Closing, Action::Stop)
            );
        }
        assert_eq!(
            transition(S::Closing, &SessionEvent::Stopped),
            (S::Terminated, Action::None)
        );
        assert_eq!(
            transition(S::Closing, &SessionEvent::Restart),
            (S::Closing, Action::None)
        );
        assert_eq!(
            transition(S::Terminated, &SessionEvent::Start),
            (S::Terminated, Action::None)
        );
    }

    #[test]
    fn test_fatal_terminates() {
        let fatal = SessionEvent::Fatal {
            generation: 1,
            message: "bad".to_string(),
        };
        assert_eq!(transition(S::Connecting, &fatal), (S::Terminated, Action::Fail));
    }

    #[test]
    fn test_unexpected_events_are_ignored() {
        assert_eq!(
            transition(S::Running, &SessionEvent::Registered { generation: 1 }),
            (S::Running, Action::None)
        );
        assert_eq!(
            transition(S::Disconnected, &closed(1)),
            (S::Disconnected, Action::None)
        );
    }
}
