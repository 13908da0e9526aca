// Copyright 2020 Joyent, Inc.

//! End-to-end scenarios against a scripted harness controller: each test
//! binds a real listener on localhost, drives the client's event loop on the
//! main thread, and plays the controller side of the protocol from a helper
//! thread.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::{Events, Poll};
use slog::{o, Drain, Level, LevelFilter, Logger};

use rq_client::client::Client;
use rq_client::message::MsgId;
use rq_client::protocol::{self, Arg, Command, Priority};

const DEADLINE: Duration = Duration::from_secs(10);

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Debug,
        ))
        .fuse(),
        o!("test" => "client_controller"),
    )
}

fn test_client() -> (Poll, Client) {
    let poll = Poll::new().expect("create poll");
    let registry = poll.registry().try_clone().expect("clone registry");
    let log = test_logger();
    let client = Client::new(registry, 0, Some(&log));
    (poll, client)
}

/// Pump the client's event loop until `done` reports true or the deadline
/// expires.
fn drive<F>(poll: &mut Poll, client: &mut Client, mut done: F)
where
    F: FnMut(&Client) -> bool,
{
    let start = Instant::now();
    let mut events = Events::with_capacity(64);
    while start.elapsed() < DEADLINE {
        if done(client) {
            return;
        }
        poll.poll(&mut events, Some(Duration::from_millis(10)))
            .expect("poll");
        for event in events.iter() {
            client.ready(event);
        }
    }
    panic!("drive: deadline expired");
}

/// One decoded command as seen by the harness controller.
#[derive(Debug, Clone, PartialEq)]
enum Cmd {
    Plain(u8),
    Int(u8, u32),
    Data(u8, Vec<u8>),
}

fn collect_cmds(buf: &[u8]) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    protocol::process(buf, &mut |code, arg| {
        match arg {
            Arg::None => cmds.push(Cmd::Plain(code)),
            Arg::Int(v) => cmds.push(Cmd::Int(code, v)),
            Arg::Data(d) => cmds.push(Cmd::Data(code, d.to_vec())),
        }
        Ok(())
    })
    .expect("harness decode");
    cmds
}

fn count_plain(cmds: &[Cmd], cmd: Command) -> usize {
    cmds.iter()
        .filter(|c| matches!(c, Cmd::Plain(code) if *code == cmd as u8))
        .count()
}

fn has_plain(cmds: &[Cmd], cmd: Command) -> bool {
    count_plain(cmds, cmd) > 0
}

fn find_int(cmds: &[Cmd], cmd: Command) -> Option<u32> {
    cmds.iter().find_map(|c| match c {
        Cmd::Int(code, v) if *code == cmd as u8 => Some(*v),
        _ => None,
    })
}

fn find_data(cmds: &[Cmd], cmd: Command) -> Option<Vec<u8>> {
    cmds.iter().find_map(|c| match c {
        Cmd::Data(code, d) if *code == cmd as u8 => Some(d.clone()),
        _ => None,
    })
}

/// Controller side: keep reading until the accumulated command stream
/// satisfies `pred`.
fn read_until<F>(stream: &mut TcpStream, acc: &mut Vec<u8>, pred: F) -> Vec<Cmd>
where
    F: Fn(&[Cmd]) -> bool,
{
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("set timeout");
    let deadline = Instant::now() + DEADLINE;
    let mut tmp = [0u8; 4096];
    loop {
        let cmds = collect_cmds(acc);
        if pred(&cmds) {
            return cmds;
        }
        assert!(
            Instant::now() < deadline,
            "controller timed out waiting, saw {:?}",
            cmds
        );
        match stream.read(&mut tmp) {
            Ok(0) => {
                let cmds = collect_cmds(acc);
                assert!(pred(&cmds), "peer closed early, saw {:?}", cmds);
                return cmds;
            }
            Ok(n) => acc.extend_from_slice(&tmp[..n]),
            Err(err)
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => panic!("controller read failed: {}", err),
        }
    }
}

fn write_frame(stream: &mut TcpStream, buf: &BytesMut) {
    stream.write_all(buf).expect("controller write");
    stream.flush().expect("controller flush");
}

#[test]
fn single_request_single_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Request)
        });
        assert_eq!(find_int(&cmds, Command::Id), Some(0));
        assert_eq!(find_data(&cmds, Command::Queue), Some(b"foo".to_vec()));
        assert_eq!(find_data(&cmds, Command::Payload), Some(b"hi".to_vec()));

        let mut buf = BytesMut::new();
        protocol::delivered_frame(&mut buf, 0);
        protocol::reply_frame(&mut buf, 0, b"ok");
        write_frame(&mut stream, &buf);
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");

    let id = client.msg_new();
    assert_eq!(id, 0);
    client.message_mut(id).unwrap().set_queue("foo").unwrap();
    client.message_mut(id).unwrap().set_data(b"hi").unwrap();

    let reply: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let reply_seen = Rc::clone(&reply);
    client
        .send(
            id,
            Some(Box::new(move |msg| {
                let prev = reply_seen.replace(Some(msg.data().to_vec()));
                assert!(prev.is_none(), "reply handler fired twice");
            })),
            None,
        )
        .expect("send");

    drive(&mut poll, &mut client, |_| reply.borrow().is_some());
    assert_eq!(reply.borrow().as_deref(), Some(&b"ok"[..]));
    assert_eq!(client.msg_used(), 0);

    controller.join().expect("controller panicked");
}

#[test]
fn consume_accepted_assigns_qid() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Consume)
        });
        assert_eq!(find_data(&cmds, Command::Queue), Some(b"work".to_vec()));
        assert_eq!(find_int(&cmds, Command::Max), Some(4));
        assert_eq!(find_int(&cmds, Command::Priority), Some(2));

        let mut buf = BytesMut::new();
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_short_str(&mut buf, Command::Queue, b"work");
        protocol::put_cmd_u16(&mut buf, Command::QueueId, 17);
        protocol::put_cmd(&mut buf, Command::Consuming);
        write_frame(&mut stream, &buf);
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");

    let accepted: Rc<RefCell<Option<(String, u16)>>> =
        Rc::new(RefCell::new(None));
    let accepted_seen = Rc::clone(&accepted);
    client
        .consume(
            "work",
            4,
            Priority::Normal,
            false,
            Box::new(|_, _| ()),
            Some(Box::new(move |name, qid| {
                let prev =
                    accepted_seen.replace(Some((name.to_string(), qid)));
                assert!(prev.is_none(), "accepted handler fired twice");
            })),
            None,
        )
        .expect("consume");

    drive(&mut poll, &mut client, |_| accepted.borrow().is_some());
    assert_eq!(
        accepted.borrow().clone(),
        Some((String::from("work"), 17))
    );

    controller.join().expect("controller panicked");
}

#[test]
fn request_for_unknown_queue_is_undelivered() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let (tx, rx) = mpsc::channel();

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");

        let mut buf = BytesMut::new();
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_u16(&mut buf, Command::Id, 42);
        protocol::put_cmd_short_str(&mut buf, Command::Queue, b"nope");
        protocol::put_cmd_large_str(&mut buf, Command::Payload, b"x");
        protocol::put_cmd(&mut buf, Command::Request);
        write_frame(&mut stream, &buf);

        let mut acc = Vec::new();
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Undelivered)
        });
        assert_eq!(find_int(&cmds, Command::Id), Some(42));
        assert!(!has_plain(&cmds, Command::Delivered));
        tx.send(()).expect("signal");
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");

    drive(&mut poll, &mut client, |_| rx.try_recv().is_ok());
    assert_eq!(client.msg_used(), 0);

    controller.join().expect("controller panicked");
}

#[test]
fn noreply_request_is_released_without_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let (tx, rx) = mpsc::channel();

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Consume)
        });

        let mut buf = BytesMut::new();
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_short_str(&mut buf, Command::Queue, b"q");
        protocol::put_cmd_u16(&mut buf, Command::QueueId, 5);
        protocol::put_cmd(&mut buf, Command::Consuming);
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_u16(&mut buf, Command::Id, 9);
        protocol::put_cmd_u16(&mut buf, Command::QueueId, 5);
        protocol::put_cmd_large_str(&mut buf, Command::Payload, b"task");
        protocol::put_cmd(&mut buf, Command::NoReply);
        protocol::put_cmd(&mut buf, Command::Request);
        write_frame(&mut stream, &buf);

        // The delivery acknowledgment must arrive, but never a REPLY.
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Delivered)
        });
        assert_eq!(find_int(&cmds, Command::Id), Some(9));
        assert!(!has_plain(&cmds, Command::Reply));
        tx.send(()).expect("signal");
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");

    let delivered: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let delivered_seen = Rc::clone(&delivered);
    client
        .consume(
            "q",
            1,
            Priority::Normal,
            false,
            Box::new(move |client, id| {
                let msg = client.message(id).expect("live message");
                assert!(msg.noreply());
                delivered_seen.replace(Some(msg.data().to_vec()));
            }),
            None,
            None,
        )
        .expect("consume");

    drive(&mut poll, &mut client, |client| {
        delivered.borrow().is_some()
            && client.msg_used() == 0
            && rx.try_recv().is_ok()
    });
    assert_eq!(delivered.borrow().as_deref(), Some(&b"task"[..]));

    controller.join().expect("controller panicked");
}

#[test]
fn refused_controller_rotates_to_tail() {
    // Bind the dead port, bind the live listener, then release the dead
    // port: connects to it are refused and the two ports cannot collide.
    let dead = TcpListener::bind("127.0.0.1:0").expect("bind");
    let dead_host =
        format!("127.0.0.1:{}", dead.local_addr().unwrap().port());
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let live_host =
        format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    drop(dead);
    let (tx, rx) = mpsc::channel();

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Request)
        });
        assert_eq!(find_data(&cmds, Command::Queue), Some(b"work".to_vec()));
        assert_eq!(
            find_data(&cmds, Command::Payload),
            Some(b"job".to_vec())
        );
        tx.send(()).expect("signal");
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&dead_host).expect("add controller");
    client.add_controller(&live_host).expect("add controller");

    let id = client.msg_new();
    client.message_mut(id).unwrap().set_queue("work").unwrap();
    client.message_mut(id).unwrap().set_data(b"job").unwrap();
    client.send(id, None, None).expect("send");

    drive(&mut poll, &mut client, |_| rx.try_recv().is_ok());

    // The refused controller rotated to the tail; the live one is the head.
    assert_eq!(
        client.controllers(),
        vec![live_host.as_str(), dead_host.as_str()]
    );
    assert_eq!(client.active_host(), Some(live_host.as_str()));

    controller.join().expect("controller panicked");
}

#[test]
fn closing_accepts_inflight_reply_then_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let (tx, rx) = mpsc::channel();

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Consume)
        });

        let mut buf = BytesMut::new();
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_short_str(&mut buf, Command::Queue, b"jobs");
        protocol::put_cmd_u16(&mut buf, Command::QueueId, 3);
        protocol::put_cmd(&mut buf, Command::Consuming);
        protocol::put_cmd(&mut buf, Command::Clear);
        protocol::put_cmd_u16(&mut buf, Command::Id, 21);
        protocol::put_cmd_u16(&mut buf, Command::QueueId, 3);
        protocol::put_cmd_large_str(&mut buf, Command::Payload, b"task");
        protocol::put_cmd(&mut buf, Command::Request);
        // Announce CLOSING while the reply is still outstanding.
        protocol::closing_frame(&mut buf);
        write_frame(&mut stream, &buf);

        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Reply)
        });
        assert_eq!(find_int(&cmds, Command::Id), Some(21));
        assert_eq!(
            find_data(&cmds, Command::Payload),
            Some(b"done".to_vec())
        );
        // The subscription added after CLOSING must not have been sent on
        // this connection.
        assert_eq!(count_plain(&cmds, Command::Consume), 1);

        // Outage: drop the connection, then take the reconnect.
        drop(stream);
        let (mut stream, _) = listener.accept().expect("re-accept");
        let mut acc = Vec::new();
        let cmds = read_until(&mut stream, &mut acc, |cmds| {
            count_plain(cmds, Command::Consume) == 2
        });
        let names: Vec<Vec<u8>> = cmds
            .iter()
            .filter_map(|c| match c {
                Cmd::Data(code, d) if *code == Command::Queue as u8 => {
                    Some(d.clone())
                }
                _ => None,
            })
            .collect();
        assert!(names.contains(&b"jobs".to_vec()));
        assert!(names.contains(&b"late".to_vec()));
        tx.send(()).expect("signal");
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");

    let inbound: Rc<RefCell<Option<MsgId>>> = Rc::new(RefCell::new(None));
    let inbound_seen = Rc::clone(&inbound);
    let dropped: Rc<RefCell<Option<u16>>> = Rc::new(RefCell::new(None));
    let dropped_seen = Rc::clone(&dropped);
    client
        .consume(
            "jobs",
            1,
            Priority::High,
            false,
            Box::new(move |_, id| {
                // Reply later, outside the handler.
                inbound_seen.replace(Some(id));
            }),
            None,
            Some(Box::new(move |name, qid| {
                assert_eq!(name, "jobs");
                dropped_seen.replace(Some(qid));
            })),
        )
        .expect("consume");

    drive(&mut poll, &mut client, |_| inbound.borrow().is_some());

    // CLOSING has arrived with the request; new subscriptions must wait for
    // the next connection.
    client
        .consume(
            "late",
            1,
            Priority::Normal,
            false,
            Box::new(|_, _| ()),
            None,
            None,
        )
        .expect("consume");

    let id = inbound.borrow().expect("inbound id");
    client.reply(id, b"done").expect("reply");
    assert_eq!(client.msg_used(), 0);

    drive(&mut poll, &mut client, |_| rx.try_recv().is_ok());
    assert_eq!(dropped.borrow().clone(), Some(3));

    controller.join().expect("controller panicked");
}

#[test]
fn shutdown_then_cleanup_releases_everything() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let controller = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut acc = Vec::new();
        read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Consume)
        });
        // Wait for the client to go away.
        let _ = read_until(&mut stream, &mut acc, |cmds| {
            has_plain(cmds, Command::Closing)
        });
    });

    let (mut poll, mut client) = test_client();
    client.add_controller(&host).expect("add controller");
    client
        .consume(
            "work",
            1,
            Priority::Normal,
            false,
            Box::new(|_, _| ()),
            None,
            None,
        )
        .expect("consume");

    drive(&mut poll, &mut client, |client| client.active_host().is_some());

    client.shutdown();
    drive(&mut poll, &mut client, |client| client.is_shut_down());
    assert_eq!(client.msg_used(), 0);
    client.cleanup().expect("cleanup");

    controller.join().expect("controller panicked");
}
