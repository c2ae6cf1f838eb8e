//! TCP bridge transport.
//!
//! Speaks to a device bridge that multiplexes protocol sessions onto a
//! paired device. One authenticated control connection establishes the
//! session; each sub-channel is its own stream tied to that session by
//! a token, so the bridge sees a single logical peer:
//!
//! ```text
//! open():          connect ──[BridgeHello]──► bridge ──[BridgeWelcome]──►
//! open_channel():  connect ──[ChannelHello { session, kind }]──► bridge
//!                  ... framed payload exchange via LinkCodec ...
//! ```
//!
//! Dropping the control connection ends the session on the bridge.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::LinkCodec;
use crate::error::LinkError;
use crate::pairing::PairingCredential;
use crate::proto;
use crate::transport::{Channel, ChannelKind, Connection, Transport};

// ── Handshake payloads ───────────────────────────────────────────

/// First frame on the control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeHello {
    pub udid: String,
    pub host_id: String,
    pub fingerprint: String,
}

/// Bridge's answer to a [`BridgeHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeWelcome {
    Accepted { session: u64 },
    Rejected { reason: String },
}

/// First frame on each sub-channel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHello {
    pub session: u64,
    pub kind: u32,
}

/// Bridge's answer to a [`ChannelHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelWelcome {
    Accepted,
    Rejected { reason: String },
}

// ── Transport ────────────────────────────────────────────────────

/// Connects to a device bridge at a fixed address.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, credential: &PairingCredential) -> Result<Box<dyn Connection>, LinkError> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        let mut control = Framed::new(stream, LinkCodec);

        let hello = BridgeHello {
            udid: credential.udid.clone(),
            host_id: credential.host_id.clone(),
            fingerprint: credential.fingerprint.clone(),
        };
        control.send(proto::encode(&hello)?.into()).await?;

        let frame = next_frame(&mut control).await?;
        match proto::decode::<BridgeWelcome>(&frame)? {
            BridgeWelcome::Accepted { session } => {
                debug!(addr = %self.addr, session, "bridge session established");
                Ok(Box::new(TcpConnection {
                    addr: self.addr.clone(),
                    session,
                    _control: Mutex::new(control),
                }))
            }
            BridgeWelcome::Rejected { reason } => Err(LinkError::PairingInvalid(reason)),
        }
    }
}

// ── Connection and channels ──────────────────────────────────────

struct TcpConnection {
    addr: String,
    session: u64,
    /// Held open for the session's lifetime; the bridge tears the
    /// session down when this closes.
    _control: Mutex<Framed<TcpStream, LinkCodec>>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn open_channel(&self, kind: ChannelKind) -> Result<Box<dyn Channel>, LinkError> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        let mut framed = Framed::new(stream, LinkCodec);

        let hello = ChannelHello {
            session: self.session,
            kind: kind as u32,
        };
        framed.send(proto::encode(&hello)?.into()).await?;

        let frame = next_frame(&mut framed).await?;
        match proto::decode::<ChannelWelcome>(&frame)? {
            ChannelWelcome::Accepted => {
                debug!(%kind, session = self.session, "sub-channel opened");
                Ok(Box::new(TcpChannel { framed }))
            }
            ChannelWelcome::Rejected { reason } => Err(LinkError::Protocol(format!(
                "{kind} channel rejected: {reason}"
            ))),
        }
    }
}

struct TcpChannel {
    framed: Framed<TcpStream, LinkCodec>,
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError> {
        self.framed.send(frame).await
    }

    async fn receive(&mut self) -> Result<Option<Bytes>, LinkError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

async fn next_frame(framed: &mut Framed<TcpStream, LinkCodec>) -> Result<Bytes, LinkError> {
    match framed.next().await {
        Some(result) => result,
        None => Err(LinkError::ConnectionLost),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingCredential;
    use tokio::net::TcpListener;

    const SESSION: u64 = 7;

    /// Minimal bridge: accepts one control connection, then serves
    /// sub-channel streams that echo every frame back.
    async fn spawn_echo_bridge(accept_pairing: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // Control connection.
            let (stream, _) = listener.accept().await.unwrap();
            let mut control = Framed::new(stream, LinkCodec);
            let frame = control.next().await.unwrap().unwrap();
            let hello: BridgeHello = proto::decode(&frame).unwrap();
            assert!(!hello.fingerprint.is_empty());

            let welcome = if accept_pairing {
                BridgeWelcome::Accepted { session: SESSION }
            } else {
                BridgeWelcome::Rejected {
                    reason: "pairing record rejected by device".into(),
                }
            };
            control
                .send(proto::encode(&welcome).unwrap().into())
                .await
                .unwrap();
            if !accept_pairing {
                return;
            }

            // Sub-channel streams.
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, LinkCodec);
                    let frame = framed.next().await.unwrap().unwrap();
                    let hello: ChannelHello = proto::decode(&frame).unwrap();
                    assert_eq!(hello.session, SESSION);

                    framed
                        .send(proto::encode(&ChannelWelcome::Accepted).unwrap().into())
                        .await
                        .unwrap();

                    while let Some(Ok(frame)) = framed.next().await {
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    fn credential() -> PairingCredential {
        PairingCredential::seal("test-udid", "test-host", b"record".to_vec())
    }

    #[tokio::test]
    async fn handshake_and_channel_echo() {
        let addr = spawn_echo_bridge(true).await;
        let transport = TcpTransport::new(addr);

        let connection = transport.open(&credential()).await.unwrap();
        let mut channel = connection.open_channel(ChannelKind::Syslog).await.unwrap();

        channel.send(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = channel.receive().await.unwrap().unwrap();
        assert_eq!(echoed, &b"ping"[..]);
    }

    #[tokio::test]
    async fn rejected_pairing_surfaces_as_invalid() {
        let addr = spawn_echo_bridge(false).await;
        let transport = TcpTransport::new(addr);

        let err = match transport.open(&credential()).await {
            Ok(_) => panic!("expected the bridge to reject the pairing"),
            Err(e) => e,
        };
        match err {
            LinkError::PairingInvalid(reason) => assert!(reason.contains("rejected")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_channels_are_independent() {
        let addr = spawn_echo_bridge(true).await;
        let transport = TcpTransport::new(addr);
        let connection = transport.open(&credential()).await.unwrap();

        let mut heartbeat = connection
            .open_channel(ChannelKind::Heartbeat)
            .await
            .unwrap();
        let mut syslog = connection.open_channel(ChannelKind::Syslog).await.unwrap();

        syslog.send(Bytes::from_static(b"log")).await.unwrap();
        heartbeat.send(Bytes::from_static(b"beat")).await.unwrap();

        assert_eq!(heartbeat.receive().await.unwrap().unwrap(), &b"beat"[..]);
        assert_eq!(syslog.receive().await.unwrap().unwrap(), &b"log"[..]);
    }
}
