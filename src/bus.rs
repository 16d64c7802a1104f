//! Event bus transport between controller and viewer.
//!
//! Each direction is one [`EventPublisher`] bound on a fixed TCP port. Every
//! connected subscriber gets its own forwarding task fed from a bounded
//! `broadcast` queue: a subscriber that falls behind loses messages instead of
//! slowing the sender, and a subscriber that connects late never sees what was
//! sent before it connected. Receivers run one [`EventListener`] loop each, which
//! reconnects after a delay when the publisher goes away.

use crate::error::{AppResult, DaqError};
use crate::messages::EventMessage;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cheap, clonable handle for publishing messages. Never blocks.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: broadcast::Sender<Arc<str>>,
}

impl EventSender {
    /// Queue `message` for every connected subscriber.
    ///
    /// Returns the number of subscribers it was queued for; zero is not an error.
    pub fn send(&self, message: &EventMessage) -> usize {
        let line: Arc<str> = Arc::from(message.to_wire());
        match self.tx.send(line) {
            Ok(receivers) => {
                debug!(%message, receivers, "bus send");
                receivers
            }
            Err(_) => {
                debug!(%message, "bus send with no subscribers");
                0
            }
        }
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// A sender that is not attached to any socket, for wiring components in tests.
    pub fn detached(capacity: usize) -> (Self, broadcast::Receiver<Arc<str>>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

/// TCP publisher for one bus direction.
pub struct EventPublisher {
    sender: EventSender,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl EventPublisher {
    /// Bind `addr` and start accepting subscribers.
    pub async fn bind(addr: &str, capacity: usize) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel::<Arc<str>>(capacity.max(1));
        let accept_tx = tx.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(%peer, "bus subscriber connected");
                        let rx = accept_tx.subscribe();
                        tokio::spawn(forward_lines(stream, rx, peer));
                    }
                    Err(err) => {
                        warn!(error = %err, "bus accept failed");
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        info!(%local_addr, "bus publisher bound");
        Ok(Self {
            sender: EventSender { tx },
            local_addr,
            accept_task,
        })
    }

    /// Handle for publishing on this port.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn forward_lines(mut stream: TcpStream, mut rx: broadcast::Receiver<Arc<str>>, peer: SocketAddr) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                let mut framed = String::with_capacity(line.len() + 1);
                framed.push_str(&line);
                framed.push('\n');
                if let Err(err) = stream.write_all(framed.as_bytes()).await {
                    info!(%peer, error = %err, "bus subscriber went away");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%peer, skipped, "bus subscriber lagged, messages dropped");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// One connection to a publisher.
pub struct EventSubscriber {
    lines: Lines<BufReader<TcpStream>>,
}

impl EventSubscriber {
    /// Connect to the publisher at `addr`.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DaqError::Bus(format!("connect {addr}: {e}")))?;
        Ok(Self {
            lines: BufReader::new(stream).lines(),
        })
    }

    /// Next decodable message; `Ok(None)` once the publisher closed the connection.
    ///
    /// Unknown kinds and unparsable payloads are logged and skipped.
    pub async fn recv(&mut self) -> AppResult<Option<EventMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            match EventMessage::from_wire(&line) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => debug!(line = %line, "ignoring unknown bus message"),
                Err(err) => warn!(error = %err, "dropping malformed bus message"),
            }
        }
        Ok(None)
    }
}

/// Receiver side of one bus direction.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one decoded message. Must tolerate repeats and gaps.
    async fn handle(&self, message: EventMessage);
}

/// Dedicated receive loop feeding an [`EventHandler`].
pub struct EventListener {
    task: JoinHandle<()>,
}

impl EventListener {
    /// Connect to `addr` (retrying every `reconnect_delay`) and dispatch to `handler`.
    pub fn spawn<H: EventHandler>(addr: String, reconnect_delay: Duration, handler: Arc<H>) -> Self {
        let task = tokio::spawn(async move {
            loop {
                match EventSubscriber::connect(&addr).await {
                    Ok(mut subscriber) => {
                        info!(%addr, "bus listener connected");
                        loop {
                            match subscriber.recv().await {
                                Ok(Some(message)) => handler.handle(message).await,
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(%addr, error = %err, "bus receive failed");
                                    break;
                                }
                            }
                        }
                        warn!(%addr, "bus connection lost, reconnecting");
                    }
                    Err(err) => debug!(%addr, error = %err, "bus publisher not reachable yet"),
                }
                sleep(reconnect_delay).await;
            }
        });
        Self { task }
    }

    /// Stop the receive loop.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
