//! Connection transport: framed messages with interleaved liveness checks.
//!
//! One `Connection` wraps one connected socket. Sends and receives must be
//! driven by one logical thread at a time; callers serialize access (one
//! in-flight request per connection). Keep-alive frames are serviced inside
//! `receive` and never surface to the caller.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{BincodeCodec, Codec};
use crate::config::TransportConfig;
use crate::error::{Result, WireError};
use crate::frame::{self, Frame, FrameBuffer};
use crate::keepalive::KeepAlive;
use crate::logger::{EventLog, NoopLog};
use crate::message::{Control, Message};
use crate::protocol::{CONTROL_MAGIC, KEEPALIVE_MAGIC};
use crate::socket::Socket;

const READ_BLOCK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

pub struct Connection {
    sock: Box<dyn Socket>,
    role: Role,
    peer: String,
    buf: FrameBuffer,
    last_action: Instant,
    keepalive: KeepAlive,
    codec: Box<dyn Codec>,
    cfg: TransportConfig,
    log: Arc<dyn EventLog>,
    closed: bool,
}

impl Connection {
    pub fn connect<A: ToSocketAddrs>(addr: A, cfg: TransportConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, Role::Client, cfg)
    }

    pub fn accept(listener: &TcpListener, cfg: TransportConfig) -> Result<Self> {
        let (stream, _addr) = listener.accept()?;
        Self::from_stream(stream, Role::Server, cfg)
    }

    pub fn from_stream(stream: TcpStream, role: Role, cfg: TransportConfig) -> Result<Self> {
        let _ = stream.set_nodelay(true);
        Self::from_socket(Box::new(stream), role, cfg)
    }

    /// Wrap an already-connected (possibly TLS) socket.
    pub fn from_socket(mut sock: Box<dyn Socket>, role: Role, cfg: TransportConfig) -> Result<Self> {
        sock.set_read_timeout(cfg.read_timeout())?;
        let peer = sock
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            sock,
            role,
            peer,
            buf: FrameBuffer::new(),
            last_action: Instant::now(),
            keepalive: KeepAlive::new(cfg.keepalive_lapse()),
            codec: Box::new(BincodeCodec),
            cfg,
            log: Arc::new(NoopLog),
            closed: false,
        })
    }

    pub fn with_logger(mut self, log: Arc<dyn EventLog>) -> Self {
        log.connected(&self.peer, self.role.as_str());
        self.log = log;
        self
    }

    pub fn with_codec(mut self, codec: Box<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub fn last_action(&self) -> Instant {
        self.last_action
    }

    /// True while a sent ping has not been answered. A caller seeing this
    /// stay true past its own deadline should judge the connection stale.
    pub fn keepalive_outstanding(&self) -> bool {
        self.keepalive.outstanding()
    }

    pub(crate) fn event_log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    /// Send one message as exactly one frame, split into packet-size writes.
    ///
    /// Writes block with no explicit timeout, relying on OS/TCP semantics;
    /// a wedged peer can hang a sender indefinitely.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = match msg {
            Message::Raw(bytes) => frame::encode_data(bytes),
            Message::Control(ctl) => {
                let body = self.codec.encode(ctl)?;
                let magic = if matches!(ctl, Control::KeepAlive { .. }) {
                    KEEPALIVE_MAGIC
                } else {
                    CONTROL_MAGIC
                };
                frame::encode_tagged(magic, &body)
            }
        };
        self.write_packets(&frame)?;
        self.last_action = Instant::now();
        Ok(())
    }

    /// Receive the next data or transfer-control message, waiting up to the
    /// configured read timeout per socket read. Keep-alive frames are
    /// serviced internally and the wait continues. `max` bounds how many
    /// bytes may be buffered for one message; 0 means no caller limit (the
    /// hard frame cap still applies).
    pub fn receive(&mut self, max: usize) -> Result<Message> {
        loop {
            if let Some(msg) = self.poll_step(max)? {
                return Ok(msg);
            }
        }
    }

    /// Like [`receive`](Self::receive), but returns `Ok(None)` instead of
    /// continuing to wait once a keep-alive frame has been serviced. Lets an
    /// idle loop notice pongs without committing to block for a real message.
    pub fn poll_receive(&mut self, max: usize) -> Result<Option<Message>> {
        self.poll_step(max)
    }

    fn poll_step(&mut self, max: usize) -> Result<Option<Message>> {
        let limit = if max == 0 {
            self.cfg.max_frame_size
        } else {
            max.min(self.cfg.max_frame_size)
        };
        loop {
            match self.buf.next_frame(limit)? {
                Some(Frame::Data(payload)) => {
                    self.last_action = Instant::now();
                    return Ok(Some(Message::Raw(payload)));
                }
                Some(Frame::Control(body)) => {
                    let ctl = self.codec.decode(&body)?;
                    self.last_action = Instant::now();
                    return Ok(Some(Message::Control(ctl)));
                }
                Some(Frame::KeepAlive(body)) => {
                    self.handle_keepalive(&body)?;
                    self.last_action = Instant::now();
                    return Ok(None);
                }
                None => self.fill_buf()?,
            }
        }
    }

    /// Send a liveness ping if the connection has been idle past the lapse.
    /// Returns whether a ping went out.
    pub fn maybe_keepalive(&mut self) -> Result<bool> {
        if !self.keepalive.due(self.last_action, Instant::now()) {
            return Ok(false);
        }
        let ping = self.keepalive.next_ping();
        let body = self.codec.encode(&ping)?;
        let fr = frame::encode_tagged(KEEPALIVE_MAGIC, &body);
        self.write_packets(&fr)?;
        self.last_action = Instant::now();
        Ok(true)
    }

    /// Shut the socket down. Idempotent; safe to call after errors. The
    /// transport never closes a connection on its own - a failed operation
    /// leaves it closable so the caller owns the reconnect decision.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.sock.shutdown();
            self.log.closed(&self.peer);
        }
    }

    fn handle_keepalive(&mut self, body: &[u8]) -> Result<()> {
        let ctl = self
            .codec
            .decode(body)
            .map_err(|_| WireError::ProtocolViolation {
                reason: format!("malformed keep-alive payload from {}", self.peer),
            })?;
        match ctl {
            Control::KeepAlive { id, ping: true } => {
                // Reply immediately; a pong never waits on anything else.
                let pong = KeepAlive::pong(id);
                let body = self.codec.encode(&pong)?;
                let fr = frame::encode_tagged(KEEPALIVE_MAGIC, &body);
                self.write_packets(&fr)
            }
            Control::KeepAlive { ping: false, .. } => {
                self.keepalive.observe_pong();
                Ok(())
            }
            _ => Err(WireError::ProtocolViolation {
                reason: format!("keep-alive frame from {} carried a non-keep-alive value", self.peer),
            }),
        }
    }

    fn write_packets(&mut self, frame: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < frame.len() {
            let end = (off + self.cfg.packet_size).min(frame.len());
            match self.sock.write(&frame[off..end]) {
                Ok(0) => {
                    return Err(WireError::ConnectionClosed {
                        peer: self.peer.clone(),
                    })
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.map_io(e)),
            }
        }
        Ok(())
    }

    fn fill_buf(&mut self) -> Result<()> {
        let mut tmp = [0u8; READ_BLOCK];
        match self.sock.read(&mut tmp) {
            Ok(0) => Err(WireError::ConnectionClosed {
                peer: self.peer.clone(),
            }),
            Ok(n) => {
                self.buf.push(&tmp[..n]);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(self.map_io(e)),
        }
    }

    fn map_io(&self, e: io::Error) -> WireError {
        use io::ErrorKind::*;
        match e.kind() {
            WouldBlock | TimedOut => WireError::Timeout {
                peer: self.peer.clone(),
            },
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
                WireError::ConnectionClosed {
                    peer: self.peer.clone(),
                }
            }
            _ => WireError::Io(e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
