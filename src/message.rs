// Copyright 2020 Joyent, Inc.

//! Message records and the slot-indexed table of in-flight messages. A
//! message is either outbound (built by the application, awaiting a REPLY
//! from the controller) or inbound (a REQUEST delivered to a consumed queue,
//! awaiting the application's reply). Both live in the same table: the slot
//! index is the message's wire identifier, so correlating an inbound REPLY or
//! DELIVERED is a direct lookup.
//!
//! Released records are parked on a pool and reused; the pool is only dropped
//! at client teardown.

use bytes::BytesMut;
use mio::Token;

use crate::client::ClientError;

/// Slot index of a message in the client's table, and simultaneously the
/// message's wire identifier.
pub type MsgId = usize;

/// Number of slots the table starts with.
const DEFAULT_SLOTS: usize = 16;

/// Callback invoked with a completed (replied or failed) outbound message.
pub type MessageHandler = Box<dyn FnMut(&Message)>;

/// The lifecycle of a message. Outbound messages move New → Delivered →
/// released-on-REPLY. Inbound messages move New → Delivering →
/// {Delivered, Replied}; Replied marks a reply issued from inside the
/// request handler.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum MessageState {
    New,
    Delivering,
    Delivered,
    Replied,
}

/// A single in-flight message, outbound or inbound.
pub struct Message {
    id: MsgId,
    src_id: Option<u16>,
    conn: Option<Token>,
    queue: Option<String>,
    state: MessageState,
    broadcast: bool,
    noreply: bool,
    sent: bool,
    data: Option<BytesMut>,
    pub(crate) reply_handler: Option<MessageHandler>,
    pub(crate) fail_handler: Option<MessageHandler>,
}

impl Message {
    fn blank() -> Message {
        Message {
            id: 0,
            src_id: None,
            conn: None,
            queue: None,
            state: MessageState::New,
            broadcast: false,
            noreply: false,
            sent: false,
            data: None,
            reply_handler: None,
            fail_handler: None,
        }
    }

    pub fn id(&self) -> MsgId {
        self.id
    }

    /// The peer's identifier for an inbound request, used when replying.
    pub fn src_id(&self) -> Option<u16> {
        self.src_id
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn noreply(&self) -> bool {
        self.noreply
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    /// True for a message delivered from a consumed queue.
    pub fn is_inbound(&self) -> bool {
        self.conn.is_some()
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// The payload: request data for an inbound message, request data before
    /// a REPLY arrives for an outbound one, reply data afterwards.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Set the target queue of an outbound message. Write-once.
    pub fn set_queue(&mut self, queue: &str) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Err(ClientError::NotOutbound(self.id));
        }
        if self.queue.is_some() {
            return Err(ClientError::AlreadySet("queue"));
        }
        if queue.is_empty() || queue.len() > 0xff {
            return Err(ClientError::QueueName(queue.len()));
        }
        self.queue = Some(queue.to_string());
        Ok(())
    }

    /// Mark an outbound message for fan-out delivery. Write-once.
    pub fn set_broadcast(&mut self) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Err(ClientError::NotOutbound(self.id));
        }
        if self.broadcast {
            return Err(ClientError::AlreadySet("broadcast"));
        }
        self.broadcast = true;
        Ok(())
    }

    /// Suppress the reply path for an outbound message. Write-once.
    pub fn set_noreply(&mut self) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Err(ClientError::NotOutbound(self.id));
        }
        if self.noreply {
            return Err(ClientError::AlreadySet("noreply"));
        }
        self.noreply = true;
        Ok(())
    }

    /// Copy the payload of an outbound message into its data buffer.
    /// Write-once, before send.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Err(ClientError::NotOutbound(self.id));
        }
        let buf = match self.data.as_mut() {
            Some(buf) => buf,
            None => return Err(ClientError::NotOutbound(self.id)),
        };
        if !buf.is_empty() {
            return Err(ClientError::AlreadySet("data"));
        }
        buf.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn conn(&self) -> Option<Token> {
        self.conn
    }

    pub(crate) fn set_src_id(&mut self, src_id: u16) {
        self.src_id = Some(src_id);
    }

    pub(crate) fn mark_noreply(&mut self) {
        self.noreply = true;
    }

    pub(crate) fn set_state(&mut self, state: MessageState) {
        self.state = state;
    }

    pub(crate) fn sent(&self) -> bool {
        self.sent
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Replace the payload, dropping the previous buffer. Used when a REPLY
    /// arrives for an outbound message, and when an inbound request's payload
    /// is moved out of the connection's parse record.
    pub(crate) fn put_data(&mut self, data: BytesMut) {
        self.data = Some(data);
    }
}

/// The dense table of in-flight messages plus the pool of released records.
pub struct MessageTable {
    list: Vec<Option<Message>>,
    used: usize,
    next_free: Option<usize>,
    pool: Vec<Message>,
}

impl MessageTable {
    pub fn new() -> MessageTable {
        let mut list = Vec::with_capacity(DEFAULT_SLOTS);
        list.resize_with(DEFAULT_SLOTS, || None);
        MessageTable {
            list,
            used: 0,
            next_free: None,
            pool: Vec::new(),
        }
    }

    /// Number of live messages.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn get(&self, id: MsgId) -> Option<&Message> {
        self.list.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: MsgId) -> Option<&mut Message> {
        self.list.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Ids of every live message, oldest slot first.
    pub fn ids(&self) -> Vec<MsgId> {
        self.list
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i))
            .collect()
    }

    /// Allocate a message and bind it to a table slot. A record is taken from
    /// the pool when one is available. An outbound message (no connection)
    /// starts with an empty owned data buffer for the caller to fill; an
    /// inbound one starts without, since the payload is moved in from the
    /// parse record.
    pub fn allocate(&mut self, conn: Option<Token>) -> MsgId {
        let mut msg = self.pool.pop().unwrap_or_else(Message::blank);
        msg.src_id = None;
        msg.conn = conn;
        msg.queue = None;
        msg.state = MessageState::New;
        msg.broadcast = false;
        msg.noreply = false;
        msg.sent = false;
        msg.reply_handler = None;
        msg.fail_handler = None;
        msg.data = if conn.is_none() {
            Some(BytesMut::new())
        } else {
            None
        };

        let slot = if self.used < self.list.len() {
            match self.next_free.take() {
                Some(hint) if self.list[hint].is_none() => hint,
                _ => self
                    .list
                    .iter()
                    .position(|slot| slot.is_none())
                    .expect("used < len implies a hole"),
            }
        } else {
            self.list.push(None);
            self.list.len() - 1
        };

        msg.id = slot;
        self.list[slot] = Some(msg);
        self.used += 1;
        slot
    }

    /// Release a slot: the record is reset, its buffer dropped, and the
    /// record parked on the pool. The freed slot becomes the allocation hint.
    pub fn release(&mut self, id: MsgId) {
        let mut msg = match self.list.get_mut(id).and_then(|slot| slot.take()) {
            Some(msg) => msg,
            None => return,
        };
        msg.src_id = None;
        msg.conn = None;
        msg.queue = None;
        msg.state = MessageState::New;
        msg.broadcast = false;
        msg.noreply = false;
        msg.sent = false;
        msg.data = None;
        msg.reply_handler = None;
        msg.fail_handler = None;
        self.pool.push(msg);
        self.next_free = Some(id);
        self.used -= 1;
    }
}

impl Default for MessageTable {
    fn default() -> MessageTable {
        MessageTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_is_wire_id() {
        let mut table = MessageTable::new();
        let a = table.allocate(None);
        let b = table.allocate(None);
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().id(), a);
        assert_eq!(table.get(b).unwrap().id(), b);
        assert_eq!(table.used(), 2);
    }

    #[test]
    fn release_sets_hint_and_empties_slot() {
        let mut table = MessageTable::new();
        let a = table.allocate(None);
        let _b = table.allocate(None);
        table.release(a);
        assert!(table.get(a).is_none());
        assert_eq!(table.next_free, Some(a));
        assert_eq!(table.used(), 1);
        // The hint is taken by the next allocation.
        let c = table.allocate(None);
        assert_eq!(c, a);
        assert_eq!(table.next_free, None);
    }

    #[test]
    fn scan_finds_hole_when_hint_is_spent() {
        let mut table = MessageTable::new();
        let ids: Vec<MsgId> = (0..4).map(|_| table.allocate(None)).collect();
        table.release(ids[1]);
        table.release(ids[3]);
        // Hint points at ids[3]; the scan must then find ids[1].
        assert_eq!(table.allocate(None), ids[3]);
        assert_eq!(table.allocate(None), ids[1]);
    }

    #[test]
    fn table_grows_by_one_when_full() {
        let mut table = MessageTable::new();
        for _ in 0..DEFAULT_SLOTS {
            table.allocate(None);
        }
        assert_eq!(table.list.len(), DEFAULT_SLOTS);
        let id = table.allocate(None);
        assert_eq!(id, DEFAULT_SLOTS);
        assert_eq!(table.list.len(), DEFAULT_SLOTS + 1);
    }

    #[test]
    fn used_tracks_live_slots() {
        let mut table = MessageTable::new();
        let ids: Vec<MsgId> = (0..5).map(|_| table.allocate(None)).collect();
        for id in &ids {
            table.release(*id);
        }
        assert!(table.is_empty());
        assert!(table.list.iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn released_records_are_pooled() {
        let mut table = MessageTable::new();
        let a = table.allocate(None);
        table.release(a);
        assert_eq!(table.pool.len(), 1);
        table.allocate(None);
        assert_eq!(table.pool.len(), 0);
    }

    #[test]
    fn outbound_gets_data_buffer_inbound_does_not() {
        let mut table = MessageTable::new();
        let out = table.allocate(None);
        assert!(table.get(out).unwrap().data.is_some());
        let inb = table.allocate(Some(Token(7)));
        let msg = table.get(inb).unwrap();
        assert!(msg.data.is_none());
        assert!(msg.is_inbound());
        assert_eq!(msg.data(), b"");
    }

    #[test]
    fn setters_are_write_once() {
        let mut table = MessageTable::new();
        let id = table.allocate(None);
        let msg = table.get_mut(id).unwrap();
        msg.set_queue("work").unwrap();
        assert!(matches!(
            msg.set_queue("other"),
            Err(ClientError::AlreadySet("queue"))
        ));
        msg.set_data(b"payload").unwrap();
        assert!(matches!(
            msg.set_data(b"more"),
            Err(ClientError::AlreadySet("data"))
        ));
        msg.set_noreply().unwrap();
        assert!(msg.set_noreply().is_err());
    }

    #[test]
    fn inbound_rejects_outbound_setters() {
        let mut table = MessageTable::new();
        let id = table.allocate(Some(Token(3)));
        let msg = table.get_mut(id).unwrap();
        assert!(matches!(
            msg.set_queue("work"),
            Err(ClientError::NotOutbound(_))
        ));
        assert!(msg.set_data(b"x").is_err());
    }

    #[test]
    fn oversize_queue_name_rejected() {
        let mut table = MessageTable::new();
        let id = table.allocate(None);
        let msg = table.get_mut(id).unwrap();
        let long = "q".repeat(256);
        assert!(matches!(
            msg.set_queue(&long),
            Err(ClientError::QueueName(256))
        ));
        let max = "q".repeat(255);
        assert!(msg.set_queue(&max).is_ok());
    }
}
