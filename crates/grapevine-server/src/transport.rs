//! Framed TCP transport for the cluster bus.
//!
//! Every bus frame is a big-endian u32 length followed by one encoded
//! `ClusterMessage`. Each connection gets a reader task and a writer task;
//! the runtime talks to the writer through a bounded `mpsc` channel and
//! hears from the reader through [`TransportEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grapevine_cluster::{ClusterMessage, LinkId, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound for one bus frame; anything larger is a protocol violation
/// and drops the connection.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
/// Outbound frames queued per link before sends start being dropped.
const WRITE_QUEUE_DEPTH: usize = 128;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the transport reports back to the runtime.
pub enum TransportEvent {
    /// A peer dialed us. The engine learns who it is from the first PING.
    InboundLink {
        link: LinkId,
        peer_ip: String,
        writer: mpsc::Sender<Bytes>,
    },
    /// An outbound dial requested via `Action::Connect` succeeded.
    ConnectFinished {
        link: LinkId,
        node: NodeId,
        writer: mpsc::Sender<Bytes>,
    },
    ConnectFailed {
        node: NodeId,
    },
    Message {
        link: LinkId,
        message: ClusterMessage,
    },
    LinkClosed {
        link: LinkId,
    },
}

/// Mints process-unique link ids.
#[derive(Debug, Default)]
pub struct LinkIds(AtomicU64);

impl LinkIds {
    pub fn next(&self) -> LinkId {
        LinkId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Accepts bus connections forever and registers each with the runtime.
pub fn spawn_listener(
    listener: TcpListener,
    ids: Arc<LinkIds>,
    events: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "bus accept failed");
                    continue;
                }
            };
            let link = ids.next();
            let (writer, read_half) = split_link(stream);
            let event = TransportEvent::InboundLink {
                link,
                peer_ip: peer.ip().to_string(),
                writer,
            };
            // register the link before the reader can report on it
            if events.send(event).await.is_err() {
                return;
            }
            tokio::spawn(read_loop(link, read_half, events.clone()));
        }
    });
}

/// Dials a peer's bus port in the background.
pub fn spawn_connect(
    node: NodeId,
    ip: String,
    cport: u16,
    ids: Arc<LinkIds>,
    events: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        let dial = TcpStream::connect((ip.as_str(), cport));
        match tokio::time::timeout(CONNECT_TIMEOUT, dial).await {
            Ok(Ok(stream)) => {
                let link = ids.next();
                let (writer, read_half) = split_link(stream);
                if events
                    .send(TransportEvent::ConnectFinished { link, node, writer })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(read_loop(link, read_half, events));
            }
            Ok(Err(err)) => {
                debug!(node = %node.short(), %ip, cport, error = %err, "bus connect failed");
                let _ = events.send(TransportEvent::ConnectFailed { node }).await;
            }
            Err(_) => {
                debug!(node = %node.short(), %ip, cport, "bus connect timed out");
                let _ = events.send(TransportEvent::ConnectFailed { node }).await;
            }
        }
    });
}

fn split_link(stream: TcpStream) -> (mpsc::Sender<Bytes>, OwnedReadHalf) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    tokio::spawn(write_loop(write_half, rx));
    (tx, read_half)
}

async fn write_loop(mut half: OwnedWriteHalf, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        let len = (frame.len() as u32).to_be_bytes();
        if half.write_all(&len).await.is_err() || half.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn read_loop(link: LinkId, mut half: OwnedReadHalf, events: mpsc::Sender<TransportEvent>) {
    loop {
        let mut len_buf = [0u8; 4];
        if half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            warn!(link = link.0, len, "bad bus frame length, dropping link");
            break;
        }
        let mut buf = vec![0u8; len];
        if half.read_exact(&mut buf).await.is_err() {
            break;
        }
        match ClusterMessage::decode(&buf) {
            Ok(message) => {
                if events
                    .send(TransportEvent::Message { link, message })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                warn!(link = link.0, error = %err, "undecodable bus message, dropping link");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::LinkClosed { link }).await;
}
