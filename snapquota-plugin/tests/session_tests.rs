mod common;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use snapquota_core::config::SessionConfig;
use snapquota_core::*;
use snapquota_plugin::*;
use snapquota_prjquota::MockBackend;

#[derive(Clone, Copy)]
enum Behaviour {
    /// Sessions stay open until stopped
    Hold,
    /// The first session closes right away, later ones stay open
    CloseFirst,
    /// Connecting always fails
    Refuse,
    /// Connecting fails with a configuration error
    Misconfigured,
}

struct MockHost {
    behaviour: Behaviour,
    connects: AtomicUsize,
}

impl MockHost {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            connects: AtomicUsize::new(0),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct MockSession {
    close_immediately: bool,
}

#[async_trait]
impl HostSession for MockSession {
    async fn run(self: Box<Self>, _handler: Arc<dyn LifecycleHandler>) -> Result<()> {
        if !self.close_immediately {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl HostConnector for MockHost {
    async fn connect(&self, _registration: &Registration) -> Result<Box<dyn HostSession>> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Hold => Ok(Box::new(MockSession {
                close_immediately: false,
            })),
            Behaviour::CloseFirst => Ok(Box::new(MockSession {
                close_immediately: n == 0,
            })),
            Behaviour::Refuse => Err(Error::session("connection refused")),
            Behaviour::Misconfigured => Err(Error::config("bad registration options")),
        }
    }
}

fn session(host: Arc<MockHost>, handler: Arc<RecordingHandler>, max_restarts: Option<u32>) -> PluginSession {
    PluginSession::new(
        Registration::new("quota-injector", "99").unwrap(),
        SessionConfig {
            restart_delay: Duration::from_secs(3),
            max_restarts,
            ..SessionConfig::default()
        },
        host,
        Arc::new(StaticRuntime(Arc::new(MockRuntime::new()))),
        handler,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_cleanly() {
    let host = MockHost::new(Behaviour::Hold);
    let handler = Arc::new(RecordingHandler::default());
    let session = session(Arc::clone(&host), Arc::clone(&handler), None);
    let control = session.control();
    let task = tokio::spawn(session.dispatch());

    wait_until(|| host.connects() == 1).await;
    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);

    control.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(control.shutdown().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_reconnects_after_backoff() {
    let host = MockHost::new(Behaviour::CloseFirst);
    let handler = Arc::new(RecordingHandler::default());
    let session = session(Arc::clone(&host), Arc::clone(&handler), None);
    let control = session.control();
    let started = tokio::time::Instant::now();
    let task = tokio::spawn(session.dispatch());

    wait_until(|| host.connects() == 2).await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    // a fresh runtime client on every connect
    assert_eq!(handler.connects.load(Ordering::SeqCst), 2);

    control.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_request_reconnects() {
    let host = MockHost::new(Behaviour::Hold);
    let session = session(Arc::clone(&host), Arc::new(RecordingHandler::default()), None);
    let control = session.control();
    let task = tokio::spawn(session.dispatch());

    wait_until(|| host.connects() == 1).await;
    control.restart().await.unwrap();
    wait_until(|| host.connects() == 2).await;

    control.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_limit() {
    let host = MockHost::new(Behaviour::Refuse);
    let session = session(Arc::clone(&host), Arc::new(RecordingHandler::default()), Some(2));

    let err = session.dispatch().await.unwrap_err();
    assert!(matches!(err, Error::Session { .. }));
    assert_eq!(host.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_configuration_errors_are_fatal() {
    let host = MockHost::new(Behaviour::Misconfigured);
    let session = session(Arc::clone(&host), Arc::new(RecordingHandler::default()), None);

    let err = session.dispatch().await.unwrap_err();
    assert!(err.to_string().contains("bad registration options"));
    assert_eq!(host.connects(), 1);
}

#[tokio::test]
async fn test_precheck_failure_stops_before_connecting() {
    let host = MockHost::new(Behaviour::Hold);
    let backend = MockBackend::new();
    backend.set_supported(false).await;

    let err = session(Arc::clone(&host), Arc::new(RecordingHandler::default()), None)
        .run(&backend, Path::new("/"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaUnsupported { .. }));
    assert_eq!(host.connects(), 0);
}
