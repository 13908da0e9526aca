// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode the
//! RISP command stream spoken between a node and its controllers. The contents
//! of this module are not needed for normal consumers of this crate, but they
//! are exposed for the special case of someone needing to implement a custom
//! peer, such as the harness controllers used by the integration tests.
//!
//! A RISP stream is a flat sequence of commands. Each command is a single
//! byte, and the numeric range the byte falls in fixes the shape of the
//! argument that follows, so a decoder can skip commands it does not know:
//!
//! | Code range    | Argument                                             |
//! | ------------- | ---------------------------------------------------- |
//! | `0x00..=0x3f` | none                                                 |
//! | `0x40..=0x5f` | 1-byte unsigned integer                              |
//! | `0x60..=0x7f` | 2-byte big-endian unsigned integer                   |
//! | `0x80..=0x9f` | 4-byte big-endian unsigned integer                   |
//! | `0xa0..=0xbf` | short string: 1-byte length, then bytes              |
//! | `0xc0..=0xdf` | string: 2-byte big-endian length, then bytes         |
//! | `0xe0..=0xff` | large string: 4-byte big-endian length, then bytes   |
//!
//! A logical record is the run of field commands between a CLEAR and the
//! terminal command that consumes them. Every frame this library emits starts
//! with CLEAR and ends with exactly one terminal; the single-byte PONG
//! heartbeat answer is the one exception.

use std::fmt;
use std::io::{Error, ErrorKind};
use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};

/// Commands understood by this library. The discriminant is the wire byte.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone, Copy)]
pub enum Command {
    Clear = 0x01,
    Exclusive = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Request = 0x05,
    Reply = 0x06,
    Delivered = 0x07,
    Broadcast = 0x08,
    Undelivered = 0x09,
    Consume = 0x0a,
    Closing = 0x0b,
    ServerFull = 0x0c,
    Consuming = 0x0d,
    NoReply = 0x0e,
    Priority = 0x40,
    Id = 0x60,
    QueueId = 0x61,
    Timeout = 0x62,
    Max = 0x63,
    Queue = 0xa0,
    Payload = 0xe0,
}

/// Delivery priority requested when consuming a queue.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone, Copy)]
pub enum Priority {
    None = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

/// The argument shape that follows a command byte, fixed by its range.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ArgClass {
    None,
    Int1,
    Int2,
    Int4,
    Str1,
    Str2,
    Str4,
}

/// Returns the argument class of a command byte. Total over all 256 codes,
/// which is what lets the decoder skip commands it has no use for.
pub fn arg_class(code: u8) -> ArgClass {
    match code {
        0x00..=0x3f => ArgClass::None,
        0x40..=0x5f => ArgClass::Int1,
        0x60..=0x7f => ArgClass::Int2,
        0x80..=0x9f => ArgClass::Int4,
        0xa0..=0xbf => ArgClass::Str1,
        0xc0..=0xdf => ArgClass::Str2,
        0xe0..=0xff => ArgClass::Str4,
    }
}

/// An error type representing a violation of the protocol by the peer.
#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    /// A numeric field carried a value outside its permitted range.
    BadValue(Command, u32),
    /// A terminal command arrived without the fields it requires.
    MissingFields(Command),
    /// Two PAYLOAD fields arrived within one record.
    DoublePayload,
    /// A reserved or out-of-place command arrived.
    Unexpected(Command),
    /// A terminal referenced a message id with no matching in-flight message.
    UnknownId(Command, u16),
    /// A QUEUE field was not valid UTF-8.
    BadQueueName,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::BadValue(cmd, value) => {
                write!(f, "value {} out of range for {:?}", value, cmd)
            }
            ProtocolError::MissingFields(cmd) => {
                write!(f, "required fields missing at {:?}", cmd)
            }
            ProtocolError::DoublePayload => {
                write!(f, "second PAYLOAD within one record")
            }
            ProtocolError::Unexpected(cmd) => {
                write!(f, "unexpected command {:?}", cmd)
            }
            ProtocolError::UnknownId(cmd, id) => {
                write!(f, "{:?} references unknown message id {}", cmd, id)
            }
            ProtocolError::BadQueueName => {
                write!(f, "queue name is not valid UTF-8")
            }
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(pe: ProtocolError) -> Self {
        Error::new(ErrorKind::InvalidData, pe.to_string())
    }
}

/// A decoded command argument, borrowing string data from the input buffer.
#[derive(Debug, PartialEq)]
pub enum Arg<'a> {
    None,
    Int(u32),
    Data(&'a [u8]),
}

/// Feed a buffer of bytes through the decoder, invoking `handler` once per
/// complete command. Returns the number of bytes consumed; a command whose
/// argument has not fully arrived is left untouched for the caller to retry
/// once more bytes are available. An error from the handler aborts the scan.
pub fn process<F>(buf: &[u8], handler: &mut F) -> Result<usize, ProtocolError>
where
    F: FnMut(u8, Arg) -> Result<(), ProtocolError>,
{
    let mut consumed = 0;

    while consumed < buf.len() {
        let code = buf[consumed];
        let rest = &buf[consumed + 1..];

        let (arg_len, arg) = match arg_class(code) {
            ArgClass::None => (0, Arg::None),
            ArgClass::Int1 => {
                if rest.is_empty() {
                    break;
                }
                (1, Arg::Int(u32::from(rest[0])))
            }
            ArgClass::Int2 => {
                if rest.len() < 2 {
                    break;
                }
                (2, Arg::Int(u32::from(BigEndian::read_u16(rest))))
            }
            ArgClass::Int4 => {
                if rest.len() < 4 {
                    break;
                }
                (4, Arg::Int(BigEndian::read_u32(rest)))
            }
            ArgClass::Str1 => {
                if rest.is_empty() {
                    break;
                }
                let len = usize::from(rest[0]);
                if rest.len() < 1 + len {
                    break;
                }
                (1 + len, Arg::Data(&rest[1..1 + len]))
            }
            ArgClass::Str2 => {
                if rest.len() < 2 {
                    break;
                }
                let len = usize::from(BigEndian::read_u16(rest));
                if rest.len() < 2 + len {
                    break;
                }
                (2 + len, Arg::Data(&rest[2..2 + len]))
            }
            ArgClass::Str4 => {
                if rest.len() < 4 {
                    break;
                }
                let len = BigEndian::read_u32(rest) as usize;
                if rest.len() < 4 + len {
                    break;
                }
                (4 + len, Arg::Data(&rest[4..4 + len]))
            }
        };

        handler(code, arg)?;
        consumed += 1 + arg_len;
    }

    Ok(consumed)
}

/// Append a no-argument command.
pub fn put_cmd(buf: &mut BytesMut, cmd: Command) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::None);
    buf.put_u8(cmd as u8);
}

/// Append a command carrying a 1-byte integer.
pub fn put_cmd_u8(buf: &mut BytesMut, cmd: Command, value: u8) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::Int1);
    buf.put_u8(cmd as u8);
    buf.put_u8(value);
}

/// Append a command carrying a 2-byte big-endian integer.
pub fn put_cmd_u16(buf: &mut BytesMut, cmd: Command, value: u16) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::Int2);
    buf.put_u8(cmd as u8);
    buf.put_u16(value);
}

/// Append a command carrying a 4-byte big-endian integer.
pub fn put_cmd_u32(buf: &mut BytesMut, cmd: Command, value: u32) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::Int4);
    buf.put_u8(cmd as u8);
    buf.put_u32(value);
}

/// Append a command carrying a short string (at most 255 bytes).
pub fn put_cmd_short_str(buf: &mut BytesMut, cmd: Command, data: &[u8]) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::Str1);
    debug_assert!(data.len() <= 0xff);
    buf.put_u8(cmd as u8);
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
}

/// Append a command carrying a large string (4-byte length).
pub fn put_cmd_large_str(buf: &mut BytesMut, cmd: Command, data: &[u8]) {
    debug_assert_eq!(arg_class(cmd as u8), ArgClass::Str4);
    buf.put_u8(cmd as u8);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

// Field-presence bits for Record.mask.
pub const MASK_ID: u16 = 0x01;
pub const MASK_QUEUEID: u16 = 0x02;
pub const MASK_TIMEOUT: u16 = 0x04;
pub const MASK_PRIORITY: u16 = 0x08;
pub const MASK_QUEUE: u16 = 0x10;
pub const MASK_PAYLOAD: u16 = 0x20;

// Flag bits for Record.flags.
pub const FLAG_NOREPLY: u16 = 0x01;

/// The per-connection parse accumulator: field commands write into it, and a
/// terminal command consumes it. The peer is required to send CLEAR at the
/// start of every record; nothing resets the accumulator implicitly.
pub struct Record {
    mask: u16,
    flags: u16,
    id: u32,
    qid: u32,
    timeout: u32,
    priority: u32,
    queue: BytesMut,
    payload: Option<BytesMut>,
}

impl Record {
    pub fn new() -> Record {
        Record {
            mask: 0,
            flags: 0,
            id: 0,
            qid: 0,
            timeout: 0,
            priority: 0,
            queue: BytesMut::new(),
            payload: None,
        }
    }

    /// Reset for the next record. The payload buffer is emptied in place and
    /// kept, unless a terminal already moved it out.
    pub fn clear(&mut self) {
        self.mask = 0;
        self.flags = 0;
        self.id = 0;
        self.qid = 0;
        self.timeout = 0;
        self.priority = 0;
        self.queue.clear();
        if let Some(payload) = self.payload.as_mut() {
            payload.clear();
        }
    }

    /// True when every bit of `mask` is present.
    pub fn has(&self, mask: u16) -> bool {
        self.mask & mask == mask
    }

    pub fn noreply(&self) -> bool {
        self.flags & FLAG_NOREPLY != 0
    }

    pub fn set_noreply(&mut self) {
        self.flags |= FLAG_NOREPLY;
    }

    pub fn set_id(&mut self, value: u32) -> Result<(), ProtocolError> {
        // ID alone admits zero.
        if value > 0xffff {
            return Err(ProtocolError::BadValue(Command::Id, value));
        }
        self.id = value;
        self.mask |= MASK_ID;
        Ok(())
    }

    pub fn set_qid(&mut self, value: u32) -> Result<(), ProtocolError> {
        if value == 0 || value > 0xffff {
            return Err(ProtocolError::BadValue(Command::QueueId, value));
        }
        self.qid = value;
        self.mask |= MASK_QUEUEID;
        Ok(())
    }

    pub fn set_timeout(&mut self, value: u32) -> Result<(), ProtocolError> {
        if value == 0 || value > 0xffff {
            return Err(ProtocolError::BadValue(Command::Timeout, value));
        }
        self.timeout = value;
        self.mask |= MASK_TIMEOUT;
        Ok(())
    }

    pub fn set_priority(&mut self, value: u32) -> Result<(), ProtocolError> {
        if value == 0 || value > 0xffff {
            return Err(ProtocolError::BadValue(Command::Priority, value));
        }
        self.priority = value;
        self.mask |= MASK_PRIORITY;
        Ok(())
    }

    pub fn set_queue(&mut self, data: &[u8]) {
        self.queue.clear();
        self.queue.extend_from_slice(data);
        self.mask |= MASK_QUEUE;
    }

    /// Store the record's payload. At most one PAYLOAD per record; the buffer
    /// from a previous record is reused when it was not moved out.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.has(MASK_PAYLOAD) {
            return Err(ProtocolError::DoublePayload);
        }
        let payload = self.payload.get_or_insert_with(BytesMut::new);
        payload.clear();
        payload.extend_from_slice(data);
        self.mask |= MASK_PAYLOAD;
        Ok(())
    }

    pub fn id(&self) -> u16 {
        self.id as u16
    }

    pub fn qid(&self) -> u16 {
        self.qid as u16
    }

    /// Informational for the controller; the client enforces no timer.
    pub fn timeout(&self) -> u16 {
        self.timeout as u16
    }

    pub fn priority(&self) -> u16 {
        self.priority as u16
    }

    pub fn queue_name(&self) -> Result<&str, ProtocolError> {
        str::from_utf8(&self.queue).map_err(|_| ProtocolError::BadQueueName)
    }

    /// Move the payload out of the record, leaving the slot empty. Ownership
    /// transfers to a message; the record allocates afresh next time.
    pub fn take_payload(&mut self) -> Option<BytesMut> {
        self.payload.take()
    }
}

impl Default for Record {
    fn default() -> Record {
        Record::new()
    }
}

/// `CLEAR [EXCLUSIVE] QUEUE=name MAX=n PRIORITY=p CONSUME`
pub fn consume_frame(
    buf: &mut BytesMut,
    name: &[u8],
    max: u16,
    priority: Priority,
    exclusive: bool,
) {
    put_cmd(buf, Command::Clear);
    if exclusive {
        put_cmd(buf, Command::Exclusive);
    }
    put_cmd_short_str(buf, Command::Queue, name);
    put_cmd_u16(buf, Command::Max, max);
    put_cmd_u8(buf, Command::Priority, priority as u8);
    put_cmd(buf, Command::Consume);
}

/// `CLEAR ID=id QUEUE=name PAYLOAD=data [NOREPLY] (BROADCAST|REQUEST)`
pub fn request_frame(
    buf: &mut BytesMut,
    id: u16,
    queue: &[u8],
    payload: &[u8],
    noreply: bool,
    broadcast: bool,
) {
    put_cmd(buf, Command::Clear);
    put_cmd_u16(buf, Command::Id, id);
    put_cmd_short_str(buf, Command::Queue, queue);
    put_cmd_large_str(buf, Command::Payload, payload);
    if noreply {
        put_cmd(buf, Command::NoReply);
    }
    if broadcast {
        put_cmd(buf, Command::Broadcast);
    } else {
        put_cmd(buf, Command::Request);
    }
}

/// `CLEAR ID=src_id [PAYLOAD=data] REPLY`; an empty reply omits PAYLOAD.
pub fn reply_frame(buf: &mut BytesMut, src_id: u16, payload: &[u8]) {
    put_cmd(buf, Command::Clear);
    put_cmd_u16(buf, Command::Id, src_id);
    if !payload.is_empty() {
        put_cmd_large_str(buf, Command::Payload, payload);
    }
    put_cmd(buf, Command::Reply);
}

/// `CLEAR ID=id DELIVERED`
pub fn delivered_frame(buf: &mut BytesMut, id: u16) {
    put_cmd(buf, Command::Clear);
    put_cmd_u16(buf, Command::Id, id);
    put_cmd(buf, Command::Delivered);
}

/// `CLEAR ID=id UNDELIVERED`
pub fn undelivered_frame(buf: &mut BytesMut, id: u16) {
    put_cmd(buf, Command::Clear);
    put_cmd_u16(buf, Command::Id, id);
    put_cmd(buf, Command::Undelivered);
}

/// `CLEAR CLOSING`
pub fn closing_frame(buf: &mut BytesMut) {
    put_cmd(buf, Command::Clear);
    put_cmd(buf, Command::Closing);
}

/// The single-byte PONG heartbeat answer.
pub fn pong_frame(buf: &mut BytesMut) {
    buf.put_u8(Command::Pong as u8);
}
