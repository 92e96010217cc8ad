//! Persistent command channel to the robot agent.
//!
//! The agent dials in and this side listens, so reconnection is always peer
//! initiated. A heartbeat task owns the accept loop: while no agent is
//! attached it waits for one, otherwise it probes with `ping` and drops the
//! connection when the probe fails. Requests are serialized through one lock
//! so a probe and a command never interleave on the wire.

use crate::config::RobotConfig;
use crate::error::ChannelError;
use crate::robot::protocol::{self, Command, ReplyMode};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request/response transport to the robot agent.
#[async_trait]
pub trait RobotLink: Send + Sync {
    /// Writes `command` and reads exactly one reply.
    async fn send(&self, command: &Command) -> Result<String, ChannelError>;

    /// Liveness probe. Any failure counts as disconnected.
    async fn is_connected(&self) -> bool;
}

/// Whether an agent is currently attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No agent, or the last one was dropped.
    Disconnected,
    /// An agent is attached.
    Connected,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Server side of the robot command channel.
pub struct CommandChannel {
    listener: TcpListener,
    connection: Mutex<Option<Connection>>,
    peer: watch::Sender<Option<SocketAddr>>,
    settings: RobotConfig,
}

impl CommandChannel {
    /// Binds the listen socket. No agent is attached until the heartbeat
    /// task accepts one.
    pub async fn bind(settings: &RobotConfig) -> Result<Arc<Self>, ChannelError> {
        let listener = TcpListener::bind(&settings.bind).await?;
        info!(addr = %listener.local_addr()?, "Robot channel listening");
        let (peer, _) = watch::channel(None);

        Ok(Arc::new(Self {
            listener,
            connection: Mutex::new(None),
            peer,
            settings: settings.clone(),
        }))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the attached agent, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.borrow()
    }

    /// Attached or not, without touching the wire.
    pub fn connection_state(&self) -> ConnectionState {
        if self.peer.borrow().is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Waits until an agent is attached, up to `limit`.
    pub async fn wait_for_peer(&self, limit: Duration) -> bool {
        let mut rx = self.peer.subscribe();
        let attached = timeout(limit, rx.wait_for(|peer| peer.is_some()))
            .await
            .map(|waited| waited.is_ok());
        matches!(attached, Ok(true))
    }

    /// Starts the accept/heartbeat loop. It runs until `cancel` fires.
    pub fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.heartbeat_loop(cancel).await })
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        loop {
            if self.connection_state() == ConnectionState::Disconnected {
                info!("Waiting for robot agent to connect");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => self.attach(stream, peer).await,
                        Err(e) => warn!(error = %e, "Robot channel accept failed"),
                    },
                }
            } else if !self.is_connected().await {
                warn!("Robot agent stopped answering, waiting for reconnect");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.heartbeat_interval()) => {}
            }
        }
        self.close().await;
        debug!("Robot heartbeat stopped");
    }

    async fn attach(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY on robot connection");
        }
        let mut slot = self.connection.lock().await;
        *slot = Some(Connection { stream, peer });
        self.peer.send_replace(Some(peer));
        info!(%peer, "Robot agent connected");
    }

    fn discard(&self, slot: &mut Option<Connection>) {
        if let Some(conn) = slot.take() {
            info!(peer = %conn.peer, "Dropping robot connection");
        }
        self.peer.send_replace(None);
    }

    /// Drops the current connection, if any.
    pub async fn close(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_mut() {
            let _ = conn.stream.shutdown().await;
        }
        self.discard(&mut slot);
    }

    async fn exchange(
        &self,
        conn: &mut Connection,
        command: &Command,
        reply_limit: Duration,
    ) -> Result<Reply, ChannelError> {
        conn.stream
            .write_all(&command.to_line())
            .await
            .map_err(|_| ChannelError::Disconnected)?;

        match command.mode() {
            ReplyMode::Simple => {
                let mut buf = vec![0u8; self.settings.reply_buffer_bytes];
                match timeout(reply_limit, conn.stream.read(&mut buf)).await {
                    Ok(Ok(0)) | Ok(Err(_)) => Err(ChannelError::Disconnected),
                    Ok(Ok(n)) => Ok(Reply::open(String::from_utf8_lossy(&buf[..n]).into_owned())),
                    Err(_) => Err(ChannelError::Timeout(reply_limit)),
                }
            }
            ReplyMode::Chunked => self.read_chunked(conn).await,
        }
    }

    /// Collects chunks until the sentinel line, peer close or a read timeout.
    async fn read_chunked(&self, conn: &mut Connection) -> Result<Reply, ChannelError> {
        let limit = self.settings.chunk_timeout();
        let mut buf = vec![0u8; self.settings.chunk_buffer_bytes];
        let mut collected: Vec<u8> = Vec::new();

        loop {
            match timeout(limit, conn.stream.read(&mut buf)).await {
                Ok(Ok(0)) if collected.is_empty() => return Err(ChannelError::Disconnected),
                Ok(Ok(0)) => {
                    debug!(bytes = collected.len(), "Robot agent closed during chunked reply");
                    return Ok(Reply::last(String::from_utf8_lossy(&collected).into_owned()));
                }
                Ok(Ok(n)) => {
                    collected.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&collected);
                    if let Some(payload) = protocol::split_at_sentinel(&text) {
                        return Ok(Reply::open(payload.to_string()));
                    }
                }
                Ok(Err(_)) => return Err(ChannelError::Disconnected),
                Err(_) if collected.is_empty() => return Err(ChannelError::Timeout(limit)),
                Err(_) => {
                    // the rest of the dump may still arrive and would be read
                    // as the next reply
                    warn!(bytes = collected.len(), "Chunked reply timed out before sentinel, resyncing");
                    return Ok(Reply::last(String::from_utf8_lossy(&collected).into_owned()));
                }
            }
        }
    }

    async fn request(&self, command: &Command, reply_limit: Duration) -> Result<String, ChannelError> {
        let mut slot = self.connection.lock().await;
        let Some(conn) = slot.as_mut() else {
            return Err(ChannelError::Disconnected);
        };

        debug!(command = %command, "Sending robot command");
        match self.exchange(conn, command, reply_limit).await {
            Ok(reply) => {
                if reply.discard {
                    self.discard(&mut slot);
                }
                Ok(reply.text)
            }
            Err(err) => {
                self.discard(&mut slot);
                Err(err)
            }
        }
    }
}

/// A reply plus whether the connection is unusable after it.
struct Reply {
    text: String,
    discard: bool,
}

impl Reply {
    fn open(text: String) -> Self {
        Self {
            text,
            discard: false,
        }
    }

    /// Partial reply after which the stream is out of step or closed.
    fn last(text: String) -> Self {
        Self {
            text,
            discard: true,
        }
    }
}

#[async_trait]
impl RobotLink for CommandChannel {
    async fn send(&self, command: &Command) -> Result<String, ChannelError> {
        let reply = self.request(command, self.settings.reply_timeout()).await?;
        debug!(command = %command, bytes = reply.len(), "Robot reply received");
        Ok(reply)
    }

    async fn is_connected(&self) -> bool {
        match self
            .request(&Command::ping(), self.settings.probe_timeout())
            .await
        {
            Ok(reply) if protocol::is_pong(&reply) => true,
            Ok(reply) => {
                debug!(reply = %reply.trim(), "Unexpected probe reply");
                let mut slot = self.connection.lock().await;
                self.discard(&mut slot);
                false
            }
            Err(_) => false,
        }
    }
}
