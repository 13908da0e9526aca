// Copyright 2020 Joyent, Inc.

//! A single connection to a controller: the socket, its readiness
//! registration, and the buffers and parse state that only exist while the
//! socket does. The connection moves through three phases:
//!
//! * `Idle`: no socket. The out-buffer survives here so a failover does not
//!   lose the connection's identity.
//! * `Connecting`: a non-blocking connect is in flight; the socket is
//!   registered for writable readiness, which is how the reactor reports
//!   connect completion.
//! * `Active`: the handshake finished; the socket is registered for readable
//!   readiness, plus writable readiness exactly while the out-buffer holds
//!   unsent bytes.
//!
//! Failover policy (which controller to try next, what happens to in-flight
//! messages) lives in the client; this module only knows how to open, drain,
//! fill, and close one socket.

use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::net::SocketAddr;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::protocol::Record;

/// Initial size of the read scratch buffer, and the increment it grows by
/// whenever a read fills it exactly.
pub const DEFAULT_BUFSIZE: usize = 4096;

enum Phase {
    Idle,
    Connecting {
        stream: TcpStream,
    },
    Active {
        stream: TcpStream,
        readbuf: Vec<u8>,
        sendbuf: BytesMut,
        inbuf: BytesMut,
        record: Record,
        closing: bool,
    },
}

/// Result of a connect-completion probe.
pub enum ConnectOutcome {
    /// The handshake finished; the connection is now active.
    Connected,
    /// A spurious wakeup; the connect is still in flight.
    Pending,
    /// The connect failed (refused, unreachable, ...).
    Failed(io::Error),
}

/// Result of draining readable bytes from the socket.
pub enum ReadOutcome {
    /// Everything available right now, prefixed with any retained tail.
    Bytes(BytesMut),
    /// Same, but the peer has closed; process the bytes, then run the
    /// closed path.
    Eof(BytesMut),
}

/// Result of a write pass over the out-buffer.
pub enum WriteOutcome {
    Ok,
    Closed,
}

pub struct Connection {
    host: String,
    addr: SocketAddr,
    token: Token,
    outbuf: BytesMut,
    shutdown: bool,
    interest: Option<Interest>,
    phase: Phase,
}

impl Connection {
    pub fn new(host: String, addr: SocketAddr, token: Token) -> Connection {
        Connection {
            host,
            addr,
            token,
            outbuf: BytesMut::with_capacity(512),
            shutdown: false,
            interest: None,
            phase: Phase::Idle,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.phase, Phase::Connecting { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active { .. })
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.phase, Phase::Active { closing: true, .. })
    }

    /// Active and still accepting new work.
    pub fn is_usable(&self) -> bool {
        matches!(self.phase, Phase::Active { closing: false, .. })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Shutdown is monotonic; there is no way back.
    pub fn mark_shutdown(&mut self) {
        self.shutdown = true;
    }

    /// Mark that CLOSING was sent or received. Only meaningful while active.
    pub fn mark_closing(&mut self) {
        if let Phase::Active { closing, .. } = &mut self.phase {
            *closing = true;
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match &mut self.phase {
            Phase::Active { record, .. } => Some(record),
            _ => None,
        }
    }

    fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.phase {
            Phase::Idle => None,
            Phase::Connecting { stream } => Some(stream),
            Phase::Active { stream, .. } => Some(stream),
        }
    }

    /// The readiness interest this connection should be registered for in its
    /// current phase.
    fn desired_interest(&self) -> Option<Interest> {
        match self.phase {
            Phase::Idle => None,
            Phase::Connecting { .. } => Some(Interest::WRITABLE),
            Phase::Active { .. } => {
                if self.outbuf.is_empty() {
                    Some(Interest::READABLE)
                } else {
                    Some(Interest::READABLE | Interest::WRITABLE)
                }
            }
        }
    }

    /// Bring the actual registration in line with the desired one. Reregisters
    /// only on change.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = self.desired_interest();
        if desired == self.interest {
            return Ok(());
        }
        let current = self.interest;
        let token = self.token;
        let stream = match self.stream_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        match (current, desired) {
            (None, Some(interest)) => {
                registry.register(stream, token, interest)?
            }
            (Some(_), Some(interest)) => {
                registry.reregister(stream, token, interest)?
            }
            _ => (),
        }
        self.interest = desired;
        Ok(())
    }

    /// Begin a non-blocking connect. Precondition: idle and not shut down.
    pub fn start_connect(&mut self, registry: &Registry) -> io::Result<()> {
        debug_assert!(self.is_idle());
        debug_assert!(!self.shutdown);
        let stream = TcpStream::connect(self.addr)?;
        self.phase = Phase::Connecting { stream };
        self.sync_interest(registry)
    }

    /// Probe a connect-completion wakeup. On success the connection becomes
    /// active with fresh read scratch, send scratch, and parse record; the
    /// caller is expected to resync interest, re-issue its CONSUMEs, and run
    /// one read pass.
    pub fn finish_connect(&mut self) -> ConnectOutcome {
        let stream = match &mut self.phase {
            Phase::Connecting { stream } => stream,
            _ => return ConnectOutcome::Pending,
        };

        match stream.take_error() {
            Ok(Some(err)) => return ConnectOutcome::Failed(err),
            Ok(None) => (),
            Err(err) => return ConnectOutcome::Failed(err),
        }
        match stream.peer_addr() {
            Ok(_) => (),
            Err(err) if err.kind() == ErrorKind::NotConnected => {
                return ConnectOutcome::Pending;
            }
            Err(err) => return ConnectOutcome::Failed(err),
        }

        let stream = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting { stream } => stream,
            _ => unreachable!(),
        };
        self.phase = Phase::Active {
            stream,
            readbuf: vec![0; DEFAULT_BUFSIZE],
            sendbuf: BytesMut::with_capacity(DEFAULT_BUFSIZE),
            inbuf: BytesMut::new(),
            record: Record::new(),
            closing: false,
        };
        ConnectOutcome::Connected
    }

    /// Drain the socket until it would block: each pass reads into the scratch
    /// buffer, and a read that fills the scratch exactly grows it by
    /// `DEFAULT_BUFSIZE` and keeps going. The returned bytes are the retained
    /// tail of the previous pass plus everything read now; the caller parses
    /// them and hands any unconsumed remainder back via `retain_tail`.
    pub fn fill(&mut self) -> ReadOutcome {
        let (stream, readbuf, inbuf) = match &mut self.phase {
            Phase::Active {
                stream,
                readbuf,
                inbuf,
                ..
            } => (stream, readbuf, inbuf),
            _ => return ReadOutcome::Bytes(BytesMut::new()),
        };

        let mut pending = mem::take(inbuf);
        loop {
            match stream.read(&mut readbuf[..]) {
                Ok(0) => return ReadOutcome::Eof(pending),
                Ok(n) => {
                    pending.extend_from_slice(&readbuf[..n]);
                    if n == readbuf.len() {
                        // Filled exactly; more is probably waiting.
                        let grown = readbuf.len() + DEFAULT_BUFSIZE;
                        readbuf.resize(grown, 0);
                    } else {
                        return ReadOutcome::Bytes(pending);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return ReadOutcome::Bytes(pending);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => (),
                Err(_) => return ReadOutcome::Eof(pending),
            }
        }
    }

    /// Keep the unconsumed tail of a parse for the next read pass.
    pub fn retain_tail(&mut self, tail: BytesMut) {
        if let Phase::Active { inbuf, .. } = &mut self.phase {
            *inbuf = tail;
        }
    }

    /// Write as much of the out-buffer as the kernel accepts, purging the
    /// sent prefix. Readiness is edge-style, so this keeps writing until the
    /// buffer drains or the kernel pushes back. Drops writable interest once
    /// the buffer is empty.
    pub fn flush(&mut self, registry: &Registry) -> WriteOutcome {
        let outbuf = &mut self.outbuf;
        let stream = match &mut self.phase {
            Phase::Active { stream, .. } => stream,
            _ => return WriteOutcome::Ok,
        };

        while !outbuf.is_empty() {
            match stream.write(&outbuf[..]) {
                Ok(0) => return WriteOutcome::Closed,
                Ok(n) => {
                    let _ = outbuf.split_to(n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => (),
                Err(_) => return WriteOutcome::Closed,
            }
        }

        let _ = self.sync_interest(registry);
        WriteOutcome::Ok
    }

    /// Assemble one outbound frame in the send scratch and append it to the
    /// out-buffer, arming writable readiness. This is the only path that
    /// schedules bytes for the wire.
    pub fn send_frame<F>(&mut self, registry: &Registry, build: F)
    where
        F: FnOnce(&mut BytesMut),
    {
        if let Phase::Active { sendbuf, .. } = &mut self.phase {
            debug_assert!(sendbuf.is_empty());
            build(sendbuf);
            self.outbuf.extend_from_slice(sendbuf);
            sendbuf.clear();
            let _ = self.sync_interest(registry);
        }
    }

    /// Tear the socket down: deregister, close, drop the per-connection parse
    /// state, and discard any unsent bytes. The connection returns to idle;
    /// the caller owns everything else the closed path implies (failing
    /// in-flight messages, rotating the pool, reconnecting).
    pub fn close(&mut self, registry: &Registry) {
        if let Some(stream) = self.stream_mut() {
            let _ = registry.deregister(stream);
        }
        self.phase = Phase::Idle;
        self.interest = None;
        self.outbuf.clear();
    }
}
