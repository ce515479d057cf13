//! Typed pub/sub buses linking the SSH layer, the management service, and the
//! port forwarder.
//!
//! Two scopes exist at runtime: one `EventBus<ServerEvent>` owned by the SSH
//! server for its whole lifetime, and one `EventBus<SessionEvent>` per
//! connection. Each subscriber observes events in publication order.

use std::net::{IpAddr, SocketAddr};
use tokio::sync::broadcast;

use crate::config::PortRange;

const BUS_CAPACITY: usize = 64;

/// Broadcast-backed pub/sub over a sealed event enum.
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Register a subscriber. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Deliver `event` to every live subscriber. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Events with server-wide observers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionEstablished {
        user: String,
        peer: SocketAddr,
    },
    ConnectionClosed {
        user: String,
        peer: SocketAddr,
    },
    /// A freshly created container opted into the management service.
    ContainerRegistered {
        container_id: String,
        ip: IpAddr,
        ports: Option<PortRange>,
    },
    /// A container asked for host `src_port` to be forwarded to
    /// `dst:dst_port`. The server deduplicates source ports before opening a
    /// listener.
    PortForwardRequest {
        src_port: u16,
        dst_port: u16,
        dst: IpAddr,
    },
}

/// Events private to one SSH connection's orchestrator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Attach a new exec. `argv: None` means the template's interactive
    /// default; `silent` suppresses the redirect banner.
    Exec {
        silent: bool,
        argv: Option<Vec<String>>,
    },
    /// Terminal dimensions from `pty-req` or `window-change`.
    Resize { width: u32, height: u32 },
    /// The exec→channel splice returned for the named exec.
    PipeBroken { exec_id: String },
    /// The client asked for an SSH subsystem by name.
    SubsystemRequest { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus: EventBus<SessionEvent> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::Exec {
            silent: false,
            argv: None,
        });
        bus.publish(SessionEvent::Resize {
            width: 80,
            height: 24,
        });
        bus.publish(SessionEvent::PipeBroken {
            exec_id: "e1".to_string(),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Exec { silent: false, argv: None }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Resize {
                width: 80,
                height: 24
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::PipeBroken { exec_id } if exec_id == "e1"
        ));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus: EventBus<ServerEvent> = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(ServerEvent::PortForwardRequest {
            src_port: 12345,
            dst_port: 80,
            dst: "172.18.0.2".parse().unwrap(),
        });

        for rx in [&mut first, &mut second] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                ServerEvent::PortForwardRequest {
                    src_port: 12345,
                    dst_port: 80,
                    ..
                }
            ));
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus: EventBus<SessionEvent> = EventBus::new();
        bus.publish(SessionEvent::SubsystemRequest {
            name: "sftp".to_string(),
        });
    }
}
