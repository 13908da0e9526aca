// Copyright 2019 Joyent, Inc.

//! RQ: a client library for a RISP-framed message-queue protocol
//!
//! RQ lets an application node act as a producer and/or consumer against one
//! of several redundant queue controllers. The client keeps a single live TCP
//! connection to the preferred controller, fails over to the alternates when
//! that connection is refused, drops, or announces CLOSING, and brokers an
//! asynchronous request/reply (and fire-and-forget) message flow over it.
//!
//! Protocol overview
//!
//! The wire format is RISP, a tag-length-value encoding in which every
//! command is a single byte whose numeric range fixes the shape of its
//! argument (none, small integer, or length-prefixed bytes). Field commands
//! accumulate into a per-connection record, and a terminal command consumes
//! the record:
//!
//! | Terminal    | Direction | Meaning |
//! | ----------- | --------- | ------- |
//! | CONSUME     | to controller   | start consuming the named queue |
//! | CONSUMING   | from controller | subscription accepted; carries the queue id |
//! | REQUEST     | both            | deliver a payload to a queue |
//! | DELIVERED   | both            | the request with this id reached a consumer |
//! | UNDELIVERED | to controller   | nobody consumes the requested queue |
//! | REPLY       | both            | the answer to a request, correlated by id |
//! | CLOSING     | both            | the sender will take no new work |
//! | PING / PONG | both            | liveness probe and its single-byte answer |
//!
//! Every record starts with CLEAR. Field commands in between (ID, QUEUEID,
//! QUEUE, PAYLOAD, TIMEOUT, PRIORITY, NOREPLY, ...) fill the named slots of
//! the record.
//!
//! ### Messaging scenarios
//!
//! **A node sends a request.** The client allocates a small integer id (the
//! slot of the message in its in-flight table), then emits
//! `CLEAR ID QUEUE PAYLOAD [NOREPLY] (BROADCAST|REQUEST)`. The controller
//! acknowledges with DELIVERED once a consumer accepted the message, and the
//! consumer's answer arrives as `CLEAR ID PAYLOAD REPLY` with the same id.
//!
//! **A node consumes a queue.** The client emits
//! `CLEAR [EXCLUSIVE] QUEUE MAX PRIORITY CONSUME`; the controller answers
//! `CLEAR QUEUE QUEUEID CONSUMING`. Requests addressed to the queue then
//! arrive as `CLEAR ID QUEUE|QUEUEID PAYLOAD [NOREPLY] REQUEST`; the client
//! immediately acknowledges DELIVERED (or UNDELIVERED), hands the payload to
//! the application's handler, and sends the application's reply back with
//! the controller's id.
//!
//! **Failover.** Controllers are tried in the order they were added. A
//! failed or closed connection moves to the tail of the pool and a connect
//! is initiated against the new head; subscriptions are re-issued on every
//! successful connect, and requests issued while no controller was reachable
//! are queued and sent right after the subscriptions.
//!
//! The client is single-threaded and non-blocking: the application owns a
//! `mio::Poll`, the client registers its sockets with the associated
//! registry, and the application forwards each event whose token the client
//! owns into [`client::Client::ready`]. No callback may block, and no
//! callback is ever invoked from anywhere but the event-loop thread.

#![allow(missing_docs)]

pub mod client;
pub mod connection;
pub mod message;
pub mod protocol;
