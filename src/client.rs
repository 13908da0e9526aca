// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating RQ clients.
//!
//! A [`Client`] holds an ordered pool of controllers, keeps a single live
//! connection to the head of that pool, and brokers the message flow in both
//! directions: requests the application sends toward queues, and requests
//! delivered to queues the application consumes. The application owns the
//! event loop; the client registers its sockets against the `mio::Registry`
//! it was built with, and the application forwards every event whose token
//! the client [`owns`](Client::owns) into [`Client::ready`].
//!
//! Failover is automatic. When the live connection is refused, drops, or
//! announces CLOSING and then goes away, the connection moves to the tail of
//! the pool and a connect is initiated against the new head. Subscriptions
//! are re-issued on every successful connect, and requests sent while no
//! controller was reachable are queued and drained after the subscriptions.
//!
//! Request handlers run on the event-loop thread and must not block. A
//! request handler may call [`Client::reply`] before returning, or keep the
//! message id and reply later; it may also issue new sends. It must not call
//! [`Client::shutdown`].

use std::collections::VecDeque;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::event::Event;
use mio::{Registry, Token};
use num::FromPrimitive;
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::connection::{
    Connection, ConnectOutcome, ReadOutcome, WriteOutcome,
};
use crate::message::{
    Message, MessageHandler, MessageState, MessageTable, MsgId,
};
use crate::protocol::{
    self, Arg, Command, Priority, ProtocolError, MASK_ID, MASK_PAYLOAD,
    MASK_QUEUE, MASK_QUEUEID,
};

/// Handler invoked with each request delivered to a consumed queue. The
/// handler receives the client back so it can reply inline or issue new
/// sends; it must not call `shutdown`.
pub type RequestHandler = Box<dyn FnMut(&mut Client, MsgId)>;

/// Handler invoked when a subscription is accepted by a controller
/// (`on_accepted`) or lost with it (`on_dropped`), with the queue name and
/// the server-assigned queue id.
pub type QueueHandler = Box<dyn FnMut(&str, u16)>;

/// An error type representing configuration problems and caller misuse.
/// Transport failures are not reported this way; those surface through the
/// `on_dropped` and fail-handler callbacks.
#[derive(Debug)]
pub enum ClientError {
    /// The controller host string did not parse.
    BadHost(String),
    /// A queue name was empty or longer than 255 bytes.
    QueueName(usize),
    /// No in-flight message has this id.
    UnknownMessage(MsgId),
    /// The operation applies only to outbound messages.
    NotOutbound(MsgId),
    /// The operation applies only to inbound messages.
    NotInbound(MsgId),
    /// The message was already handed to `send`.
    AlreadySent(MsgId),
    /// A write-once message field was set twice.
    AlreadySet(&'static str),
    /// `send` requires a target queue.
    MissingQueue(MsgId),
    /// `send` requires a non-empty payload.
    EmptyPayload(MsgId),
    /// The message is not in a state that permits the operation.
    BadState(MsgId),
    /// `reply` on a message flagged noreply or broadcast.
    ReplyNotExpected(MsgId),
    /// `cleanup` before shutdown completed.
    NotShutDown,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::BadHost(host) => {
                write!(f, "unparsable controller host {:?}", host)
            }
            ClientError::QueueName(len) => {
                write!(f, "queue name length {} outside 1..=255", len)
            }
            ClientError::UnknownMessage(id) => {
                write!(f, "no in-flight message with id {}", id)
            }
            ClientError::NotOutbound(id) => {
                write!(f, "message {} is not outbound", id)
            }
            ClientError::NotInbound(id) => {
                write!(f, "message {} is not inbound", id)
            }
            ClientError::AlreadySent(id) => {
                write!(f, "message {} was already sent", id)
            }
            ClientError::AlreadySet(field) => {
                write!(f, "message field {:?} was already set", field)
            }
            ClientError::MissingQueue(id) => {
                write!(f, "message {} has no target queue", id)
            }
            ClientError::EmptyPayload(id) => {
                write!(f, "message {} has an empty payload", id)
            }
            ClientError::BadState(id) => {
                write!(f, "message {} is in the wrong state", id)
            }
            ClientError::ReplyNotExpected(id) => {
                write!(f, "message {} does not take a reply", id)
            }
            ClientError::NotShutDown => {
                write!(f, "cleanup requires a completed shutdown")
            }
        }
    }
}

impl From<ClientError> for Error {
    fn from(ce: ClientError) -> Self {
        Error::new(ErrorKind::InvalidInput, ce.to_string())
    }
}

/// A queue this client consumes: the parameters sent with CONSUME, the
/// server-assigned queue id (zero until CONSUMING arrives), and the
/// application's handlers. The request handler slot is vacated while the
/// handler runs, which is what lets the handler borrow the client.
struct Subscription {
    name: String,
    max: u16,
    priority: Priority,
    exclusive: bool,
    qid: u16,
    on_request: Option<RequestHandler>,
    on_accepted: Option<QueueHandler>,
    on_dropped: Option<QueueHandler>,
}

/// A client node: producer and/or consumer against a pool of redundant
/// controllers.
pub struct Client {
    registry: Registry,
    log: Logger,
    conns: VecDeque<Connection>,
    queues: Vec<Subscription>,
    msgs: MessageTable,
    pending: VecDeque<MsgId>,
    next_token: usize,
    dispatching: bool,
}

impl Client {
    /// Create a client. Connection sockets are registered against `registry`
    /// with tokens allocated sequentially from `first_token`; pick a range
    /// that does not collide with the application's other sockets. If no
    /// logger is provided the slog `StdLog` drain is used by default.
    pub fn new(
        registry: Registry,
        first_token: usize,
        log: Option<&Logger>,
    ) -> Client {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Client {
            registry,
            log,
            conns: VecDeque::new(),
            queues: Vec::new(),
            msgs: MessageTable::new(),
            pending: VecDeque::new(),
            next_token: first_token,
            dispatching: false,
        }
    }

    /// Append a controller to the pool. If it is the first, a non-blocking
    /// connect is initiated immediately.
    pub fn add_controller(&mut self, host: &str) -> Result<(), ClientError> {
        let addr = parse_host(host)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.conns
            .push_back(Connection::new(host.to_string(), addr, token));
        info!(self.log, "controller added"; "host" => host);
        if self.conns.len() == 1 {
            self.connect_head();
        }
        Ok(())
    }

    /// True when `token` belongs to one of this client's sockets; the
    /// application's event loop uses this to route events.
    pub fn owns(&self, token: Token) -> bool {
        self.conns.iter().any(|c| c.token() == token)
    }

    /// Host of the currently live controller, if any.
    pub fn active_host(&self) -> Option<&str> {
        self.conns
            .front()
            .filter(|c| c.is_active())
            .map(|c| c.host())
    }

    /// Controller hosts in current pool order (head first).
    pub fn controllers(&self) -> Vec<&str> {
        self.conns.iter().map(|c| c.host()).collect()
    }

    /// Number of in-flight messages, inbound and outbound combined.
    pub fn msg_used(&self) -> usize {
        self.msgs.used()
    }

    /// True once every connection is shut down and socket-less.
    pub fn is_shut_down(&self) -> bool {
        self.conns.iter().all(|c| c.is_shutdown() && c.is_idle())
    }

    /// Declare that this client consumes `name`. Duplicate names are a
    /// no-op. If a controller is live the CONSUME is sent immediately;
    /// otherwise it goes out with the next successful connect, as do all
    /// subscriptions after a failover.
    #[allow(clippy::too_many_arguments)]
    pub fn consume(
        &mut self,
        name: &str,
        max: u16,
        priority: Priority,
        exclusive: bool,
        on_request: RequestHandler,
        on_accepted: Option<QueueHandler>,
        on_dropped: Option<QueueHandler>,
    ) -> Result<(), ClientError> {
        if name.is_empty() || name.len() > 0xff {
            return Err(ClientError::QueueName(name.len()));
        }
        if self.queues.iter().any(|q| q.name == name) {
            return Ok(());
        }
        self.queues.push(Subscription {
            name: name.to_string(),
            max,
            priority,
            exclusive,
            qid: 0,
            on_request: Some(on_request),
            on_accepted,
            on_dropped,
        });
        debug!(self.log, "consuming queue"; "queue" => name);
        let qi = self.queues.len() - 1;
        if self.head_is_usable() {
            self.send_consume(0, qi);
        }
        Ok(())
    }

    /// Allocate an outbound message. The caller fills it in through
    /// [`Client::message_mut`] and the `Message` setters, then hands it to
    /// [`Client::send`].
    pub fn msg_new(&mut self) -> MsgId {
        self.msgs.allocate(None)
    }

    pub fn message(&self, id: MsgId) -> Option<&Message> {
        self.msgs.get(id)
    }

    pub fn message_mut(&mut self, id: MsgId) -> Option<&mut Message> {
        self.msgs.get_mut(id)
    }

    /// Send an outbound message to its queue. If no controller is currently
    /// usable the message is retained and goes out right after the
    /// subscriptions on the next successful connect. `reply_handler` fires
    /// when the REPLY arrives; `fail_handler` fires if the connection
    /// carrying the request is lost first.
    pub fn send(
        &mut self,
        id: MsgId,
        reply_handler: Option<MessageHandler>,
        fail_handler: Option<MessageHandler>,
    ) -> Result<(), ClientError> {
        {
            let msg = self
                .msgs
                .get_mut(id)
                .ok_or(ClientError::UnknownMessage(id))?;
            if msg.is_inbound() {
                return Err(ClientError::NotOutbound(id));
            }
            if msg.sent() {
                return Err(ClientError::AlreadySent(id));
            }
            if msg.state() != MessageState::New {
                return Err(ClientError::BadState(id));
            }
            if msg.queue().is_none() {
                return Err(ClientError::MissingQueue(id));
            }
            if msg.data().is_empty() {
                return Err(ClientError::EmptyPayload(id));
            }
            msg.reply_handler = reply_handler;
            msg.fail_handler = fail_handler;
            msg.mark_sent();
        }
        if self.head_is_usable() {
            self.emit_request(0, id);
        } else {
            debug!(self.log, "no usable controller, message queued";
                   "msg_id" => id);
            self.pending.push_back(id);
        }
        Ok(())
    }

    /// Reply to an inbound request. Legal from inside the request handler
    /// (the message is then released once the handler returns) or any time
    /// after it returned (the message is released here). An empty `data` is
    /// a valid reply.
    pub fn reply(&mut self, id: MsgId, data: &[u8]) -> Result<(), ClientError> {
        let (token, src_id, state) = {
            let msg =
                self.msgs.get(id).ok_or(ClientError::UnknownMessage(id))?;
            if !msg.is_inbound() {
                return Err(ClientError::NotInbound(id));
            }
            if msg.noreply() || msg.broadcast() {
                return Err(ClientError::ReplyNotExpected(id));
            }
            match msg.state() {
                MessageState::Delivering | MessageState::Delivered => (),
                _ => return Err(ClientError::BadState(id)),
            }
            let token = msg.conn().expect("inbound message has a connection");
            let src_id = msg.src_id().expect("inbound message has a src id");
            (token, src_id, msg.state())
        };

        let idx = self
            .conns
            .iter()
            .position(|c| c.token() == token && c.is_active())
            .ok_or(ClientError::BadState(id))?;
        let Client {
            conns, registry, ..
        } = self;
        conns[idx].send_frame(registry, |buf| {
            protocol::reply_frame(buf, src_id, data)
        });

        if state == MessageState::Delivered {
            // The handler returned long ago; nothing else will clean up.
            self.msgs.release(id);
            self.maybe_finish_shutdown();
        } else {
            self.msgs
                .get_mut(id)
                .expect("checked above")
                .set_state(MessageState::Replied);
        }
        Ok(())
    }

    /// Reactor entry point: the application forwards every event whose token
    /// this client owns.
    pub fn ready(&mut self, event: &Event) {
        let token = event.token();
        let idx = match self.conns.iter().position(|c| c.token() == token) {
            Some(idx) => idx,
            None => return,
        };

        if self.conns[idx].is_connecting() {
            self.connect_ready(idx);
            return;
        }

        if self.conns[idx].is_active() && event.is_readable() {
            self.process_read(idx);
        }
        // The read may have closed and rotated the connection; find it again.
        if event.is_writable() {
            if let Some(idx) = self
                .conns
                .iter()
                .position(|c| c.token() == token && c.is_active())
            {
                self.process_write(idx);
            }
        }
    }

    /// Begin shutting down every connection. Mid-connect connections are
    /// cancelled on the spot; active ones send CLOSING and close once no
    /// messages are outstanding. Once [`Client::is_shut_down`] reports true,
    /// [`Client::cleanup`] releases everything.
    pub fn shutdown(&mut self) {
        info!(self.log, "shutdown requested");
        // Closing a connection rotates the pool, so restart the scan after
        // each close; the monotonic shutdown mark guarantees progress.
        loop {
            let idx = match self.conns.iter().position(|c| !c.is_shutdown()) {
                Some(idx) => idx,
                None => break,
            };
            self.conns[idx].mark_shutdown();
            if self.conns[idx].is_connecting() {
                self.conn_closed(idx);
            } else if self.conns[idx].is_active() {
                let Client {
                    conns, registry, ..
                } = self;
                conns[idx]
                    .send_frame(registry, |buf| protocol::closing_frame(buf));
                conns[idx].mark_closing();
                if self.msgs.is_empty() {
                    // Best-effort push of the CLOSING before the socket goes.
                    let _ = self.conns[idx].flush(&self.registry);
                    self.conn_closed(idx);
                }
            }
        }
    }

    /// Release every resource. Requires shutdown to have completed and the
    /// message table to have drained.
    pub fn cleanup(self) -> Result<(), ClientError> {
        if !self.is_shut_down() || !self.msgs.is_empty() {
            return Err(ClientError::NotShutDown);
        }
        // Connections, subscriptions, message slots, and the record pool all
        // drop here.
        Ok(())
    }

    fn head_is_usable(&self) -> bool {
        self.conns.front().map_or(false, |c| c.is_usable())
    }

    /// Initiate a connect against the head of the pool. A no-op unless the
    /// head is idle and not shut down. A synchronous connect failure rotates
    /// and tries the next entry; each entry is attempted at most once.
    fn connect_head(&mut self) {
        for _ in 0..self.conns.len() {
            let conn = match self.conns.front_mut() {
                Some(conn) => conn,
                None => return,
            };
            if conn.is_shutdown() || !conn.is_idle() {
                return;
            }
            match conn.start_connect(&self.registry) {
                Ok(()) => {
                    debug!(self.log, "connect initiated";
                           "host" => conn.host());
                    return;
                }
                Err(err) => {
                    warn!(self.log, "connect failed";
                          "host" => conn.host(), "err" => %err);
                    conn.close(&self.registry);
                    if self.conns.len() > 1 {
                        let conn = self.conns.pop_front().unwrap();
                        self.conns.push_back(conn);
                    } else {
                        return;
                    }
                }
            }
        }
    }

    fn connect_ready(&mut self, idx: usize) {
        match self.conns[idx].finish_connect() {
            ConnectOutcome::Pending => (),
            ConnectOutcome::Failed(err) => {
                warn!(self.log, "connect refused";
                      "host" => self.conns[idx].host(), "err" => %err);
                self.conn_closed(idx);
            }
            ConnectOutcome::Connected => {
                info!(self.log, "controller connected";
                      "host" => self.conns[idx].host());
                let _ = self.conns[idx].sync_interest(&self.registry);
                for qi in 0..self.queues.len() {
                    self.send_consume(idx, qi);
                }
                self.drain_pending(idx);
                // Some stacks hand over data together with the
                // connect-complete wakeup.
                self.process_read(idx);
            }
        }
    }

    fn send_consume(&mut self, idx: usize, qi: usize) {
        let Client {
            conns,
            queues,
            registry,
            ..
        } = self;
        let q = &queues[qi];
        conns[idx].send_frame(registry, |buf| {
            protocol::consume_frame(
                buf,
                q.name.as_bytes(),
                q.max,
                q.priority,
                q.exclusive,
            )
        });
    }

    fn emit_request(&mut self, idx: usize, id: MsgId) {
        let Client {
            conns,
            msgs,
            registry,
            ..
        } = self;
        let msg = match msgs.get(id) {
            Some(msg) => msg,
            None => return,
        };
        let queue = msg.queue().expect("send checked the queue").as_bytes();
        conns[idx].send_frame(registry, |buf| {
            protocol::request_frame(
                buf,
                id as u16,
                queue,
                msg.data(),
                msg.noreply(),
                msg.broadcast(),
            )
        });
    }

    fn drain_pending(&mut self, idx: usize) {
        while let Some(id) = self.pending.pop_front() {
            debug!(self.log, "sending queued message"; "msg_id" => id);
            self.emit_request(idx, id);
        }
    }

    fn process_read(&mut self, idx: usize) {
        let token = self.conns[idx].token();
        let (bytes, eof) = match self.conns[idx].fill() {
            ReadOutcome::Bytes(bytes) => (bytes, false),
            ReadOutcome::Eof(bytes) => (bytes, true),
        };

        self.dispatching = true;
        let result = self.dispatch_bytes(idx, bytes);
        self.dispatching = false;

        match result {
            Ok(()) => {
                // A release inside the batch may have drained the table while
                // a shutdown was waiting on it; that close rotates the pool,
                // so the connection has to be found again for the EOF case.
                self.maybe_finish_shutdown();
                if eof {
                    if let Some(idx) = self
                        .conns
                        .iter()
                        .position(|c| c.token() == token && !c.is_idle())
                    {
                        info!(self.log, "controller closed the connection";
                              "host" => self.conns[idx].host());
                        self.conn_closed(idx);
                    }
                }
            }
            Err(err) => {
                // The batch aborted in place, so the index is still good.
                error!(self.log, "protocol error, dropping connection";
                       "host" => self.conns[idx].host(), "err" => %err);
                self.conn_closed(idx);
            }
        }
    }

    fn process_write(&mut self, idx: usize) {
        match self.conns[idx].flush(&self.registry) {
            WriteOutcome::Ok => (),
            WriteOutcome::Closed => {
                warn!(self.log, "write failed, dropping connection";
                      "host" => self.conns[idx].host());
                self.conn_closed(idx);
            }
        }
    }

    /// Run a batch of received bytes through the decoder. The unconsumed
    /// tail (a command split across reads) is retained for the next pass.
    fn dispatch_bytes(
        &mut self,
        idx: usize,
        mut bytes: bytes::BytesMut,
    ) -> Result<(), ProtocolError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let consumed = protocol::process(&bytes, &mut |code, arg| {
            self.on_command(idx, code, arg)
        })?;
        let tail = bytes.split_off(consumed);
        self.conns[idx].retain_tail(tail);
        Ok(())
    }

    /// One decoded command: field commands accumulate into the connection's
    /// current record, terminal commands consume it.
    fn on_command(
        &mut self,
        idx: usize,
        code: u8,
        arg: Arg,
    ) -> Result<(), ProtocolError> {
        let cmd = match Command::from_u8(code) {
            Some(cmd) => cmd,
            None => {
                debug!(self.log, "skipping unknown command"; "code" => code);
                return Ok(());
            }
        };

        let record = match self.conns[idx].record_mut() {
            Some(record) => record,
            None => return Ok(()),
        };

        match (cmd, arg) {
            (Command::Clear, Arg::None) => {
                record.clear();
                Ok(())
            }
            (Command::NoReply, Arg::None) => {
                record.set_noreply();
                Ok(())
            }
            (Command::Id, Arg::Int(v)) => record.set_id(v),
            (Command::QueueId, Arg::Int(v)) => record.set_qid(v),
            (Command::Timeout, Arg::Int(v)) => record.set_timeout(v),
            (Command::Priority, Arg::Int(v)) => record.set_priority(v),
            (Command::Queue, Arg::Data(data)) => {
                record.set_queue(data);
                Ok(())
            }
            (Command::Payload, Arg::Data(data)) => record.set_payload(data),
            (Command::Ping, Arg::None) => {
                let Client {
                    conns, registry, ..
                } = self;
                conns[idx]
                    .send_frame(registry, |buf| protocol::pong_frame(buf));
                Ok(())
            }
            (Command::Pong, Arg::None) => Ok(()),
            (Command::Consuming, Arg::None) => self.cmd_consuming(idx),
            (Command::Request, Arg::None) => self.cmd_request(idx),
            (Command::Reply, Arg::None) => self.cmd_reply(idx),
            (Command::Delivered, Arg::None) => self.cmd_delivered(idx),
            (Command::Closing, Arg::None) => self.cmd_closing(idx),
            // Reserved toward us, or only ever client-emitted.
            (cmd, _) => Err(ProtocolError::Unexpected(cmd)),
        }
    }

    /// CONSUMING: the controller accepted a subscription and assigned its
    /// queue id. Ignored when no subscription matches the name.
    fn cmd_consuming(&mut self, idx: usize) -> Result<(), ProtocolError> {
        let (qid, name) = {
            let record = self.conns[idx].record_mut().expect("active");
            if !record.has(MASK_QUEUEID | MASK_QUEUE) {
                return Err(ProtocolError::MissingFields(Command::Consuming));
            }
            (record.qid(), record.queue_name()?.to_string())
        };

        if let Some(q) =
            self.queues.iter_mut().find(|q| q.name == name)
        {
            q.qid = qid;
            debug!(self.log, "subscription accepted";
                   "queue" => name.as_str(), "qid" => qid);
            if let Some(handler) = q.on_accepted.as_mut() {
                handler(&name, qid);
            }
        }
        Ok(())
    }

    /// REQUEST: a message delivered to a queue this client consumes. The
    /// payload moves out of the record into a fresh inbound message, the
    /// controller gets DELIVERED (or UNDELIVERED when nothing matches), and
    /// the queue's request handler runs.
    fn cmd_request(&mut self, idx: usize) -> Result<(), ProtocolError> {
        let (src_id, qid, name, noreply) = {
            let record = self.conns[idx].record_mut().expect("active");
            let complete = record.has(MASK_ID)
                && record.has(MASK_PAYLOAD)
                && (record.has(MASK_QUEUEID) || record.has(MASK_QUEUE));
            if !complete {
                return Err(ProtocolError::MissingFields(Command::Request));
            }
            let qid = if record.has(MASK_QUEUEID) {
                Some(record.qid())
            } else {
                None
            };
            let name = if record.has(MASK_QUEUE) {
                Some(record.queue_name()?.to_string())
            } else {
                None
            };
            (record.id(), qid, name, record.noreply())
        };

        // Queue id wins over name when both are present.
        let qi = qid
            .and_then(|v| self.queues.iter().position(|q| q.qid == v))
            .or_else(|| {
                name.as_deref().and_then(|n| {
                    self.queues.iter().position(|q| q.name == n)
                })
            });

        let qi = match qi {
            Some(qi) => qi,
            None => {
                debug!(self.log, "request for queue nobody consumes";
                       "src_id" => src_id);
                let Client {
                    conns, registry, ..
                } = self;
                conns[idx].send_frame(registry, |buf| {
                    protocol::undelivered_frame(buf, src_id)
                });
                return Ok(());
            }
        };

        {
            let Client {
                conns, registry, ..
            } = self;
            conns[idx].send_frame(registry, |buf| {
                protocol::delivered_frame(buf, src_id)
            });
        }

        let token = self.conns[idx].token();
        let payload = self.conns[idx]
            .record_mut()
            .expect("active")
            .take_payload()
            .unwrap_or_default();

        let id = self.msgs.allocate(Some(token));
        {
            let msg = self.msgs.get_mut(id).expect("just allocated");
            msg.set_src_id(src_id);
            if noreply {
                msg.mark_noreply();
            }
            msg.put_data(payload);
            msg.set_state(MessageState::Delivering);
        }

        // Vacate the handler slot so the handler can borrow the client.
        let mut handler = self.queues[qi].on_request.take();
        if let Some(handler) = handler.as_mut() {
            handler(self, id);
        }
        self.queues[qi].on_request = handler;

        let release = match self.msgs.get(id) {
            Some(msg) => {
                msg.noreply() || msg.state() == MessageState::Replied
            }
            None => false,
        };
        if release {
            self.msgs.release(id);
            self.maybe_finish_shutdown();
        } else if let Some(msg) = self.msgs.get_mut(id) {
            // Keep it live until the application replies.
            msg.set_state(MessageState::Delivered);
        }
        Ok(())
    }

    /// REPLY: the answer to an outbound request. The payload replaces the
    /// message's data, the reply handler fires, and the slot is released.
    fn cmd_reply(&mut self, idx: usize) -> Result<(), ProtocolError> {
        let id = {
            let record = self.conns[idx].record_mut().expect("active");
            if !record.has(MASK_ID | MASK_PAYLOAD) {
                return Err(ProtocolError::MissingFields(Command::Reply));
            }
            record.id()
        };

        let valid = match self.msgs.get(MsgId::from(id)) {
            Some(msg) => {
                !msg.is_inbound()
                    && msg.src_id().is_none()
                    && msg.state() == MessageState::Delivered
            }
            None => false,
        };
        if !valid {
            return Err(ProtocolError::UnknownId(Command::Reply, id));
        }

        let payload = self.conns[idx]
            .record_mut()
            .expect("active")
            .take_payload()
            .unwrap_or_default();

        let id = MsgId::from(id);
        let mut handler = {
            let msg = self.msgs.get_mut(id).expect("validated");
            msg.put_data(payload);
            msg.reply_handler.take()
        };
        if let Some(handler) = handler.as_mut() {
            handler(self.msgs.get(id).expect("validated"));
        }
        self.msgs.release(id);
        self.maybe_finish_shutdown();
        Ok(())
    }

    /// DELIVERED: the controller confirmed delivery of an outbound request.
    /// The message advances to Delivered and stays live awaiting REPLY; a
    /// noreply request has no reply coming, so it is released here.
    fn cmd_delivered(&mut self, idx: usize) -> Result<(), ProtocolError> {
        let id = {
            let record = self.conns[idx].record_mut().expect("active");
            if !record.has(MASK_ID) {
                return Err(ProtocolError::MissingFields(Command::Delivered));
            }
            record.id()
        };

        let noreply = match self.msgs.get_mut(MsgId::from(id)) {
            Some(msg)
                if !msg.is_inbound()
                    && msg.state() == MessageState::New =>
            {
                msg.set_state(MessageState::Delivered);
                msg.noreply()
            }
            _ => {
                return Err(ProtocolError::UnknownId(Command::Delivered, id));
            }
        };
        if noreply {
            // No REPLY will ever come for it; this is the last word.
            self.msgs.release(MsgId::from(id));
            self.maybe_finish_shutdown();
        }
        Ok(())
    }

    /// CLOSING: the controller will accept no new work on this connection.
    /// Rotation happens on the eventual failure; meanwhile try the current
    /// head, which is a no-op when the head (possibly this very connection)
    /// is not idle.
    fn cmd_closing(&mut self, idx: usize) -> Result<(), ProtocolError> {
        if self.conns[idx].is_closing() {
            return Err(ProtocolError::Unexpected(Command::Closing));
        }
        info!(self.log, "controller is closing";
              "host" => self.conns[idx].host());
        self.conns[idx].mark_closing();
        self.connect_head();
        Ok(())
    }

    /// The closed path: tear the socket down, fail the messages that rode on
    /// it, notify dropped subscriptions, rotate the pool, reconnect.
    fn conn_closed(&mut self, idx: usize) {
        let token = self.conns[idx].token();
        let was_active = self.conns[idx].is_active();
        self.conns[idx].close(&self.registry);

        // Inbound messages owned by this connection can never be replied to;
        // outbound messages already written to it will never see a REPLY.
        // Messages still waiting in the pending FIFO survive the failover.
        for id in self.msgs.ids() {
            let failed = {
                let msg = self.msgs.get(id).expect("listed");
                match msg.conn() {
                    Some(owner) => owner == token,
                    None => {
                        was_active
                            && msg.sent()
                            && !self.pending.contains(&id)
                    }
                }
            };
            if failed {
                let mut handler =
                    self.msgs.get_mut(id).expect("listed").fail_handler.take();
                if let Some(handler) = handler.as_mut() {
                    handler(self.msgs.get(id).expect("listed"));
                }
                self.msgs.release(id);
            }
        }

        if was_active {
            // Server-assigned queue ids die with the connection; the next
            // connect re-issues CONSUME and CONSUMING reassigns them.
            for q in self.queues.iter_mut() {
                if q.qid != 0 {
                    let qid = q.qid;
                    q.qid = 0;
                    if let Some(handler) = q.on_dropped.as_mut() {
                        handler(&q.name, qid);
                    }
                }
            }
        }

        if self.conns.len() > 1 {
            let conn = self.conns.remove(idx).expect("valid index");
            self.conns.push_back(conn);
        }

        self.connect_head();
    }

    /// Connections told to shut down while messages were outstanding close
    /// once the table drains. Closing rotates the pool, so while a byte batch
    /// is being dispatched this waits; the read path retries afterwards.
    fn maybe_finish_shutdown(&mut self) {
        if self.dispatching || !self.msgs.is_empty() {
            return;
        }
        while let Some(idx) = self
            .conns
            .iter()
            .position(|c| c.is_shutdown() && c.is_closing())
        {
            let _ = self.conns[idx].flush(&self.registry);
            self.conn_closed(idx);
        }
    }
}

/// Parse a controller host string: `addr`, `addr:port`, `[ipv6]`, or
/// `[ipv6]:port`. A missing port means 0, to be resolved by the caller's
/// configuration layer; an explicit port must be within 1..=65535.
fn parse_host(host: &str) -> Result<SocketAddr, ClientError> {
    let bad = || ClientError::BadHost(host.to_string());

    if let Some(rest) = host.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(bad)?;
        let addr: Ipv6Addr = rest[..close].parse().map_err(|_| bad())?;
        let after = &rest[close + 1..];
        let port = if after.is_empty() {
            0
        } else {
            let digits = after.strip_prefix(':').ok_or_else(bad)?;
            parse_port(digits).ok_or_else(bad)?
        };
        Ok(SocketAddr::new(IpAddr::V6(addr), port))
    } else if host.matches(':').count() >= 2 {
        // A bare IPv6 address; with two or more colons there is no way to
        // carry a port without brackets.
        let addr: Ipv6Addr = host.parse().map_err(|_| bad())?;
        Ok(SocketAddr::new(IpAddr::V6(addr), 0))
    } else if let Some(colon) = host.find(':') {
        let addr: Ipv4Addr = host[..colon].parse().map_err(|_| bad())?;
        let port = parse_port(&host[colon + 1..]).ok_or_else(bad)?;
        Ok(SocketAddr::new(IpAddr::V4(addr), port))
    } else {
        let addr: Ipv4Addr = host.parse().map_err(|_| bad())?;
        Ok(SocketAddr::new(IpAddr::V4(addr), 0))
    }
}

fn parse_port(digits: &str) -> Option<u16> {
    let port: u32 = digits.parse().ok()?;
    if port == 0 || port > 65535 {
        None
    } else {
        Some(port as u16)
    }
}
