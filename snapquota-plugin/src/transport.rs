//! Host runtime transport: newline-delimited JSON over a Unix socket
//!
//! After connecting, the plugin sends one `register` frame and waits for
//! `registered`. The host then streams `event` frames, each answered by a
//! `reply` carrying the same sequence number, until it sends `shutdown` or
//! closes the socket.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use snapquota_core::{Error, LifecycleEvent, Result};

use crate::coordinator::LifecycleHandler;
use crate::session::{HostConnector, HostSession, Registration};

/// Frames sent by the plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginFrame {
    /// Register the plugin
    Register {
        /// Plugin name
        name: String,
        /// Plugin index
        index: String,
        /// Subscribed event kinds
        events: Vec<String>,
    },
    /// Outcome of one event
    Reply {
        /// Sequence number of the event
        seq: u64,
        /// Error message, `None` on success
        error: Option<String>,
    },
}

/// Frames sent by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Registration accepted
    Registered,
    /// A lifecycle event to handle
    Event {
        /// Sequence number to reply with
        seq: u64,
        /// The event
        event: LifecycleEvent,
    },
    /// The host is closing the session
    Shutdown,
}

impl From<&Registration> for PluginFrame {
    fn from(r: &Registration) -> Self {
        Self::Register {
            name: r.name.clone(),
            index: r.index.clone(),
            events: r.events.clone(),
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &PluginFrame) -> Result<()> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| Error::session(format!("failed to encode frame: {e}")))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Sequence number of anything shaped like an event frame
fn event_seq(value: &serde_json::Value) -> Option<u64> {
    if value.get("type")?.as_str()? != "event" {
        return None;
    }
    value.get("seq")?.as_u64()
}

/// Connects to the host runtime's plugin socket
#[derive(Debug, Clone)]
pub struct SocketConnector {
    socket: PathBuf,
}

impl SocketConnector {
    /// Connector for the socket at `socket`
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl HostConnector for SocketConnector {
    async fn connect(&self, registration: &Registration) -> Result<Box<dyn HostSession>> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::session(format!("failed to connect to {}: {e}", self.socket.display()))
        })?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        write_frame(&mut writer, &PluginFrame::from(registration)).await?;

        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| Error::session("host closed the connection during registration"))?;
        match serde_json::from_str::<HostFrame>(&line) {
            Ok(HostFrame::Registered) => {}
            Ok(other) => {
                return Err(Error::session(format!(
                    "expected registration acknowledgement, got {other:?}"
                )));
            }
            Err(e) => return Err(Error::session(format!("malformed host frame: {e}"))),
        }

        info!(
            socket = %self.socket.display(),
            name = %registration.name,
            index = %registration.index,
            "Registered with host runtime"
        );

        Ok(Box::new(SocketSession { lines, writer }))
    }
}

/// A registered session over a Unix socket
struct SocketSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl HostSession for SocketSession {
    async fn run(self: Box<Self>, handler: Arc<dyn LifecycleHandler>) -> Result<()> {
        let Self { mut lines, mut writer } = *self;

        // replies from concurrent handlers funnel through one writer
        let (reply_tx, mut reply_rx) = mpsc::channel::<PluginFrame>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "Failed to write reply");
                    break;
                }
            }
        });

        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Host closed the connection");
                    break Ok(());
                }
                Err(e) => break Err(Error::session(format!("read failed: {e}"))),
            };
            if line.trim().is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, %line, "Ignoring malformed host frame");
                    continue;
                }
            };
            let seq = event_seq(&value);

            match serde_json::from_value::<HostFrame>(value) {
                Ok(HostFrame::Event { seq, event }) => {
                    let handler = Arc::clone(&handler);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let error = match handler.handle(&event).await {
                            Ok(()) => None,
                            Err(e) => {
                                warn!(
                                    seq,
                                    event = event.kind(),
                                    container_id = %event.container_id(),
                                    error = %e,
                                    "Event handler failed"
                                );
                                Some(e.to_string())
                            }
                        };
                        if reply_tx.send(PluginFrame::Reply { seq, error }).await.is_err() {
                            debug!(seq, "Session closed before reply");
                        }
                    });
                }
                Ok(HostFrame::Shutdown) => {
                    info!("Host requested shutdown");
                    break Ok(());
                }
                Ok(HostFrame::Registered) => debug!("Ignoring duplicate registration acknowledgement"),
                Err(e) => match seq {
                    // the host still waits on this sequence number
                    Some(seq) => {
                        warn!(seq, error = %e, "Rejecting malformed event");
                        let error = Some(format!("malformed event: {e}"));
                        if reply_tx.send(PluginFrame::Reply { seq, error }).await.is_err() {
                            debug!(seq, "Session closed before reply");
                        }
                    }
                    None => warn!(error = %e, %line, "Ignoring malformed host frame"),
                },
            }
        };

        drop(reply_tx);
        if result.is_err() {
            writer_task.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_shape() {
        let registration = Registration::new("quota-injector", "99").unwrap();
        let json = serde_json::to_value(PluginFrame::from(&registration)).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["name"], "quota-injector");
        assert_eq!(json["index"], "99");
        assert_eq!(json["events"][0], "post_create_container");
    }

    #[test]
    fn test_event_frame_parse() {
        let line = r#"{"type":"event","seq":7,"event":{"type":"remove_container","pod":{"id":"sb","name":"web","namespace":"default"},"container":{"id":"c1","name":"app"}}}"#;
        let frame: HostFrame = serde_json::from_str(line).unwrap();
        let HostFrame::Event { seq, event } = frame else {
            panic!("expected event frame");
        };
        assert_eq!(seq, 7);
        assert_eq!(event.kind(), "remove_container");
        assert_eq!(event.container_id().as_str(), "c1");
    }

    #[test]
    fn test_event_seq_recovery() {
        let bad_id = serde_json::json!({
            "type": "event",
            "seq": 5,
            "event": {"type": "remove_container", "container": {"id": "bad id"}}
        });
        assert_eq!(event_seq(&bad_id), Some(5));
        assert!(serde_json::from_value::<HostFrame>(bad_id).is_err());

        assert_eq!(event_seq(&serde_json::json!({"type": "event"})), None);
        assert_eq!(event_seq(&serde_json::json!({"type": "shutdown", "seq": 1})), None);
    }

    #[test]
    fn test_reply_frame_shape() {
        let ok = serde_json::to_string(&PluginFrame::Reply { seq: 1, error: None }).unwrap();
        assert_eq!(ok, r#"{"type":"reply","seq":1,"error":null}"#);
    }
}
