//! End-to-end tests for sessions and services over real sockets.
//!
//! Each test runs the service on its own [`LoopThread`] and the client on
//! the test thread, driving the client loop either through the synchronous
//! calls or by pumping it with `service_loop`.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=conduit=debug cargo test --features tracing --test messaging -- --nocapture
//! ```

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use type_hash::TypeHash;

use conduit::event_loop::{EventLoop, LoopConfig, LoopThread, LoopThreadConfig};
use conduit::messaging::frame::{HEADER_SIZE, Handshake, decode_frame, encode_frame};
use conduit::messaging::{
    CloseReason, MessageError, MessagingConfig, PathDirectory, Protocol, Received, SeqPacket,
    Service, ServiceDirectory, Session, SessionError, SessionState, Violation,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        conduit::init_tracing();
    });
}

const SERVICE: &str = "echo";

#[derive(Serialize, Deserialize, TypeHash, Debug, PartialEq)]
struct EchoV1 {
    text: String,
    count: u32,
}

fn echo_protocol() -> Protocol {
    Protocol::of::<EchoV1>("echo", 256)
}

/// Advertises the echo service on a fresh loop thread and returns once it
/// accepts connections.
fn serve<F>(root: &Path, protocol: Protocol, setup: F) -> LoopThread
where
    F: FnOnce(&Service) + Send + 'static,
{
    init_test_tracing();
    let root = root.to_path_buf();
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread = LoopThread::spawn(LoopThreadConfig::named("server"), move |l| {
        let service = Service::advertise(
            l,
            protocol,
            SERVICE,
            Rc::new(PathDirectory::new(root)),
            MessagingConfig::default(),
        )
        .expect("advertise");
        setup(&service);
        ready_tx.send(()).unwrap();
        service
    })
    .expect("spawn server");
    ready_rx.recv().expect("server ready");
    thread
}

fn client_loop() -> EventLoop {
    EventLoop::new(LoopConfig::named("client")).unwrap()
}

fn client(l: &EventLoop, root: &Path, protocol: Protocol) -> Session {
    client_with(l, root, protocol, MessagingConfig::default())
}

fn client_with(l: &EventLoop, root: &Path, protocol: Protocol, config: MessagingConfig) -> Session {
    Session::new(l, protocol, SERVICE, Rc::new(PathDirectory::new(root)), config).unwrap()
}

/// Services `l` until `done` holds, giving up after a few seconds.
fn pump_until(l: &EventLoop, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
        l.service_loop().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Server behaviour shared by most tests:
/// - 7: takes the fd, writes through it, answers `"<id>:<payload>"` as 8
/// - 13: drops the request unanswered
/// - 99: kills the session
/// - 20: decodes an [`EchoV1`] and answers it with `count` doubled
/// - anything else: echoes requests, ignores one-way messages
fn echo_handlers(service: &Service) {
    service.set_receive_handler(|_, session, mut msg| match msg.msg_id() {
        7 => {
            if let Some(fd) = msg.take_fd() {
                UnixStream::from(fd).write_all(b"hello through fd").unwrap();
            }
            let reply = format!("{}:{}", msg.msg_id(), String::from_utf8_lossy(msg.payload()));
            msg.set_msg_id(8);
            msg.set_payload(reply.as_bytes()).unwrap();
            msg.respond().unwrap();
        }
        13 => drop(msg),
        20 => {
            let mut echo: EchoV1 = msg.decode().unwrap();
            echo.count *= 2;
            msg.encode(&echo).unwrap();
            msg.respond().unwrap();
        }
        99 => session.kill(),
        _ => {
            if msg.needs_response() {
                msg.respond().unwrap();
            }
        }
    });
}

#[test]
fn request_with_fd_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();
    assert_eq!(session.state(), SessionState::Open);

    let (mut local, remote) = UnixStream::pair().unwrap();
    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(7);
    msg.set_payload(b"ping").unwrap();
    msg.set_fd(OwnedFd::from(remote)).unwrap();

    let response = session
        .request_sync_response(msg)
        .unwrap()
        .expect("response");
    assert_eq!(response.msg_id(), 8);
    assert_eq!(response.payload(), b"7:ping");
    assert_eq!(response.raw_fd(), -1);

    let mut got = [0u8; 16];
    local.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hello through fd");

    session.close();
    server.stop(0).unwrap();
}

#[test]
fn fd_travels_from_server_to_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), |service| {
        service.set_receive_handler(|_, _, mut msg| {
            let (mut ours, theirs) = UnixStream::pair().unwrap();
            ours.write_all(b"from server").unwrap();
            msg.set_fd(OwnedFd::from(theirs)).unwrap();
            msg.respond().unwrap();
        });
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let msg = session.create_msg().unwrap();
    let mut response = session.request_sync_response(msg).unwrap().unwrap();
    assert!(response.raw_fd() >= 0);
    let mut passed = UnixStream::from(response.take_fd().unwrap());
    let mut got = [0u8; 11];
    passed.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"from server");

    server.stop(0).unwrap();
}

#[test]
fn typed_payload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(20);
    msg.encode(&EchoV1 {
        text: "typed".into(),
        count: 21,
    })
    .unwrap();
    let response = session.request_sync_response(msg).unwrap().unwrap();
    assert_eq!(
        response.decode::<EchoV1>().unwrap(),
        EchoV1 {
            text: "typed".into(),
            count: 42,
        }
    );
    server.stop(0).unwrap();
}

#[test]
fn one_way_messages_arrive_in_send_order() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let server = serve(dir.path(), echo_protocol(), move |service| {
        service.set_receive_handler(move |_, _, msg| {
            tx.send(msg.msg_id()).unwrap();
        });
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();
    for id in 0..10 {
        let mut msg = session.create_msg().unwrap();
        msg.set_msg_id(id);
        session.send(msg).unwrap();
    }

    let got: Vec<u32> = (0..10)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
    server.stop(0).unwrap();
}

#[test]
fn async_request_gets_its_response() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let got = Rc::new(RefCell::new(None));
    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(3);
    msg.set_payload(b"async").unwrap();
    let sink = Rc::clone(&got);
    session
        .request_response(msg, move |_, response| {
            *sink.borrow_mut() = Some(response.map(|m| m.payload().to_vec()));
        })
        .unwrap();

    assert!(pump_until(&l, || got.borrow().is_some()));
    assert_eq!(got.borrow().clone().unwrap().as_deref(), Some(&b"async"[..]));
    server.stop(0).unwrap();
}

#[test]
fn async_open_reports_through_callback() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    let opened = Rc::new(Cell::new(None));
    let flag = Rc::clone(&opened);
    session
        .open(move |_, s, result| {
            assert_eq!(s.state(), SessionState::Open);
            flag.set(Some(result.is_ok()));
        })
        .unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    assert!(pump_until(&l, || opened.get().is_some()));
    assert_eq!(opened.get(), Some(true));
    server.stop(0).unwrap();
}

#[test]
fn killed_session_ends_sync_call_and_closes_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    let closes = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&closes);
    session.set_close_handler(move |_, _, reason| seen.borrow_mut().push(reason));
    session.open_sync().unwrap();

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(99);
    assert!(session.request_sync_response(msg).unwrap().is_none());
    assert_eq!(session.state(), SessionState::Closed);

    assert!(pump_until(&l, || !closes.borrow().is_empty()));
    for _ in 0..20 {
        l.service_loop().unwrap();
    }
    assert_eq!(*closes.borrow(), vec![CloseReason::PeerClosed]);
    server.stop(0).unwrap();
}

#[test]
fn unanswered_request_kills_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let server = serve(dir.path(), echo_protocol(), move |service| {
        echo_handlers(service);
        service
            .add_close_handler(move |_, _, reason| tx.send(reason).unwrap())
            .unwrap();
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(13);
    assert!(session.request_sync_response(msg).unwrap().is_none());
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        CloseReason::Killed(Violation::UnansweredRequest)
    );
    server.stop(0).unwrap();
}

#[test]
fn protocol_mismatch_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let opened = tx.clone();
    let server = serve(dir.path(), Protocol::new("echo", 1, 64), move |service| {
        service.set_receive_handler(move |_, _, _| tx.send("message").unwrap());
        service
            .add_open_handler(move |_, _| opened.send("open").unwrap())
            .unwrap();
    });

    let l = client_loop();
    let session = client(&l, dir.path(), Protocol::new("echo", 2, 64));
    session.set_receive_handler(|_, _, _| panic!("mismatched session delivered a message"));

    assert!(matches!(
        session.open_sync(),
        Err(SessionError::ProtocolMismatch(_))
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    server.stop(0).unwrap();
}

#[test]
fn handshake_times_out_on_silent_listener() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let addr = PathDirectory::new(dir.path()).advertise(SERVICE).unwrap();
    let _listener = SeqPacket::listen(addr.path(), 4).unwrap();

    let l = client_loop();
    let config = MessagingConfig {
        handshake_timeout: Duration::from_millis(50),
        ..MessagingConfig::default()
    };
    let session = client_with(&l, dir.path(), echo_protocol(), config);

    assert!(matches!(session.open_sync(), Err(SessionError::Timeout(_))));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn second_fd_is_rejected_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());

    for _ in 0..100 {
        let mut msg = session.create_msg().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        msg.set_fd(OwnedFd::from(a)).unwrap();
        assert!(msg.set_fd(OwnedFd::from(b)).is_err());
    }
    assert_eq!(session.pool().in_use(), 0);
}

#[test]
fn exhausted_pool_fails_create_msg() {
    let dir = tempfile::tempdir().unwrap();
    let l = client_loop();
    let config = MessagingConfig {
        pool_capacity: 2,
        ..MessagingConfig::default()
    };
    let session = client_with(&l, dir.path(), echo_protocol(), config);

    let _a = session.create_msg().unwrap();
    let _b = session.create_msg().unwrap();
    assert!(matches!(
        session.create_msg(),
        Err(MessageError::OutOfMemory { capacity: 2, .. })
    ));
}

/// Serves `protocol` with a receive handler that must never run, and
/// reports every session close.
fn serve_expecting_kill(root: &Path, protocol: Protocol) -> (LoopThread, mpsc::Receiver<CloseReason>) {
    let (tx, rx) = mpsc::channel();
    let server = serve(root, protocol, move |service| {
        service.set_receive_handler(|_, _, msg| panic!("bad frame delivered as msg {}", msg.msg_id()));
        service
            .add_close_handler(move |_, _, reason| tx.send(reason).unwrap())
            .unwrap();
    });
    (server, rx)
}

/// Connects and completes the handshake by hand, so tests can put frames
/// on the wire that a [`Session`] would never send.
fn open_by_hand(root: &Path, protocol: &Protocol, max_payload: u32) -> SeqPacket {
    let addr = PathDirectory::new(root).resolve(SERVICE).unwrap();
    let raw = SeqPacket::try_connect(addr.path()).unwrap().unwrap();
    let mut frame = Vec::new();
    Handshake::Hello {
        max_payload,
        protocol: protocol.name().into(),
    }
    .encode(protocol.hash(), &mut frame);
    raw.try_send(&frame, None).unwrap().unwrap();

    let mut buf = [0u8; 256];
    let Received::Packet { len, .. } = recv_blocking(&raw, &mut buf) else {
        panic!("server hung up during handshake");
    };
    let (header, payload) = decode_frame(&buf[..len]).unwrap();
    assert_eq!(
        Handshake::decode(&header, payload).unwrap(),
        Handshake::Welcome { max_payload }
    );
    raw
}

fn assert_killed(raw: &SeqPacket, closes: &mpsc::Receiver<CloseReason>, violation: Violation) {
    assert_eq!(
        closes.recv_timeout(Duration::from_secs(5)).unwrap(),
        CloseReason::Killed(violation)
    );
    let mut buf = [0u8; 64];
    assert!(matches!(recv_blocking(raw, &mut buf), Received::Closed));
}

#[test]
fn oversized_frame_kills_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let protocol = Protocol::new("echo", 0x5eed, 16);
    let (server, closes) = serve_expecting_kill(dir.path(), protocol.clone());
    let raw = open_by_hand(dir.path(), &protocol, 16);

    let mut frame = Vec::new();
    encode_frame(&mut frame, protocol.hash(), 1, 0, &[0xAA; 64]);
    assert_eq!(frame.len(), HEADER_SIZE + 64);
    raw.try_send(&frame, None).unwrap().unwrap();

    assert_killed(&raw, &closes, Violation::Oversized);
    server.stop(0).unwrap();
}

#[test]
fn foreign_protocol_hash_kills_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let protocol = Protocol::new("echo", 0x5eed, 16);
    let (server, closes) = serve_expecting_kill(dir.path(), protocol.clone());
    let raw = open_by_hand(dir.path(), &protocol, 16);

    let mut frame = Vec::new();
    encode_frame(&mut frame, protocol.hash() ^ 1, 1, 0, b"hi");
    raw.try_send(&frame, None).unwrap().unwrap();

    assert_killed(&raw, &closes, Violation::HashMismatch);
    server.stop(0).unwrap();
}

#[test]
fn payload_length_disagreeing_with_datagram_kills_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let protocol = Protocol::new("echo", 0x5eed, 16);
    let (server, closes) = serve_expecting_kill(dir.path(), protocol.clone());
    let raw = open_by_hand(dir.path(), &protocol, 16);

    let mut frame = Vec::new();
    encode_frame(&mut frame, protocol.hash(), 1, 0, b"four");
    // Claim eight payload bytes where four were sent.
    frame[12..16].copy_from_slice(&8u32.to_le_bytes());
    raw.try_send(&frame, None).unwrap().unwrap();

    assert_killed(&raw, &closes, Violation::Malformed);
    server.stop(0).unwrap();
}

#[test]
fn two_fds_on_one_frame_kill_the_session() {
    use std::io::IoSlice;
    use std::mem::MaybeUninit;
    use std::os::fd::AsFd;

    use rustix::net::{SendAncillaryBuffer, SendAncillaryMessage, SendFlags, sendmsg};

    let dir = tempfile::tempdir().unwrap();
    let protocol = Protocol::new("echo", 0x5eed, 16);
    let (server, closes) = serve_expecting_kill(dir.path(), protocol.clone());
    let raw = open_by_hand(dir.path(), &protocol, 16);

    let mut frame = Vec::new();
    encode_frame(&mut frame, protocol.hash(), 1, 0, b"fds");
    let (a, b) = UnixStream::pair().unwrap();
    let fds = [a.as_fd(), b.as_fd()];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(2))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    assert!(control.push(SendAncillaryMessage::ScmRights(&fds)));
    sendmsg(&raw, &[IoSlice::new(&frame)], &mut control, SendFlags::NOSIGNAL).unwrap();

    assert_killed(&raw, &closes, Violation::TooManyFds);
    server.stop(0).unwrap();
}

fn recv_blocking(socket: &SeqPacket, buf: &mut [u8]) -> Received {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(received) = socket.try_recv(buf).unwrap() {
            return received;
        }
        assert!(Instant::now() < deadline, "nothing received");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn nested_sync_request_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let nested = Rc::new(RefCell::new(None));
    let (slot, inner_session) = (Rc::clone(&nested), session.clone());
    l.queue_function(move |_| {
        let msg = inner_session.create_msg().unwrap();
        let refused = matches!(
            inner_session.request_sync_response(msg),
            Err(SessionError::NestedSyncWait)
        );
        *slot.borrow_mut() = Some(refused);
    });

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(1);
    msg.set_payload(b"outer").unwrap();
    let response = session.request_sync_response(msg).unwrap().unwrap();
    assert_eq!(response.payload(), b"outer");
    assert_eq!(*nested.borrow(), Some(true));
    server.stop(0).unwrap();
}

#[test]
fn open_handler_sees_peer_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let server = serve(dir.path(), echo_protocol(), move |service| {
        service
            .add_open_handler(move |_, session| {
                tx.send(session.peer_credentials().map(|c| c.pid)).unwrap();
            })
            .unwrap();
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let pid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(pid, Some(std::process::id() as i32));
    assert_eq!(
        session.peer_credentials().map(|c| c.uid),
        Some(rustix::process::getuid().as_raw())
    );
    server.stop(0).unwrap();
}

#[test]
fn withdraw_severs_open_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let server = serve(dir.path(), echo_protocol(), move |service| {
        let withdraw = service.clone();
        service.set_receive_handler(move |_, _, msg| {
            if msg.msg_id() == 50 {
                withdraw.withdraw();
            }
        });
        service
            .add_close_handler(move |_, _, reason| tx.send(reason).unwrap())
            .unwrap();
    });

    let l = client_loop();
    let first = client(&l, dir.path(), echo_protocol());
    let second = client(&l, dir.path(), echo_protocol());
    first.open_sync().unwrap();
    second.open_sync().unwrap();

    let closed = Rc::new(Cell::new(0));
    for session in [&first, &second] {
        let closed = Rc::clone(&closed);
        session.set_close_handler(move |_, _, reason| {
            assert_eq!(reason, CloseReason::PeerClosed);
            closed.set(closed.get() + 1);
        });
    }

    let mut msg = first.create_msg().unwrap();
    msg.set_msg_id(50);
    first.send(msg).unwrap();

    assert!(pump_until(&l, || closed.get() == 2));
    for _ in 0..2 {
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            CloseReason::Local
        );
    }
    assert!(PathDirectory::new(dir.path()).resolve(SERVICE).is_err());

    let late = client(&l, dir.path(), echo_protocol());
    assert!(matches!(
        late.open_sync(),
        Err(SessionError::Unavailable { .. })
    ));
    server.stop(0).unwrap();
}

#[test]
fn send_on_server_side_session_reaches_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), |service| {
        service
            .add_open_handler(|_, session| {
                let mut msg = session.create_msg().unwrap();
                msg.set_msg_id(42);
                msg.set_payload(b"welcome aboard").unwrap();
                session.send(msg).unwrap();
            })
            .unwrap();
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&got);
    session.set_receive_handler(move |_, _, msg| {
        assert!(!msg.needs_response());
        sink.borrow_mut().push((msg.msg_id(), msg.payload().to_vec()));
    });
    session.open_sync().unwrap();

    assert!(pump_until(&l, || !got.borrow().is_empty()));
    assert_eq!(got.borrow()[0], (42, b"welcome aboard".to_vec()));
    server.stop(0).unwrap();
}

#[test]
fn client_session_can_reopen_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), echo_handlers);

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.send(session.create_msg().unwrap()),
        Err(SessionError::NotOpen(_))
    ));

    session.open_sync().unwrap();
    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(2);
    msg.set_payload(b"again").unwrap();
    let response = session.request_sync_response(msg).unwrap().unwrap();
    assert_eq!(response.payload(), b"again");
    server.stop(0).unwrap();
}

#[test]
fn hidden_service_keeps_existing_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), |service| {
        let hide = service.clone();
        service.set_receive_handler(move |_, _, msg| {
            if msg.msg_id() == 60 {
                hide.hide();
            }
            if msg.needs_response() {
                msg.respond().unwrap();
            }
        });
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(60);
    assert!(session.request_sync_response(msg).unwrap().is_some());
    assert!(PathDirectory::new(dir.path()).resolve(SERVICE).is_err());

    let late = client(&l, dir.path(), echo_protocol());
    assert!(matches!(
        late.open_sync(),
        Err(SessionError::Unavailable { .. })
    ));

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(61);
    msg.set_payload(b"still here").unwrap();
    let response = session.request_sync_response(msg).unwrap().unwrap();
    assert_eq!(response.payload(), b"still here");
    assert_eq!(session.state(), SessionState::Open);
    server.stop(0).unwrap();
}

#[test]
fn response_sent_before_close_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), |service| {
        service.set_receive_handler(|_, session, msg| {
            msg.respond().unwrap();
            session.close();
        });
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    let closed = Rc::new(Cell::new(None));
    let sink = Rc::clone(&closed);
    session.set_close_handler(move |_, _, reason| sink.set(Some(reason)));
    session.open_sync().unwrap();

    let mut msg = session.create_msg().unwrap();
    msg.set_msg_id(5);
    msg.set_payload(b"last words").unwrap();
    let response = session.request_sync_response(msg).unwrap();
    assert_eq!(response.unwrap().payload(), b"last words");

    assert!(pump_until(&l, || closed.get().is_some()));
    assert_eq!(closed.get(), Some(CloseReason::PeerClosed));
    assert_eq!(session.state(), SessionState::Closed);
    server.stop(0).unwrap();
}

#[test]
fn one_way_sent_before_close_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(dir.path(), echo_protocol(), |service| {
        service
            .add_open_handler(|_, session| {
                let mut msg = session.create_msg().unwrap();
                msg.set_msg_id(42);
                session.send(msg).unwrap();
                session.close();
            })
            .unwrap();
    });

    let l = client_loop();
    let session = client(&l, dir.path(), echo_protocol());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    session.set_receive_handler(move |_, _, msg| sink.borrow_mut().push(format!("msg:{}", msg.msg_id())));
    let sink = Rc::clone(&seen);
    session.set_close_handler(move |_, _, reason| sink.borrow_mut().push(format!("close:{reason:?}")));
    session.open_sync().unwrap();

    assert!(pump_until(&l, || seen.borrow().len() == 2));
    assert_eq!(*seen.borrow(), ["msg:42", "close:PeerClosed"]);
    server.stop(0).unwrap();
}

#[test]
fn full_backlog_does_not_block_open() {
    const CLIENTS: usize = 8;

    let dir = tempfile::tempdir().unwrap();
    init_test_tracing();
    let l = client_loop();
    let config = MessagingConfig {
        listen_backlog: 1,
        ..MessagingConfig::default()
    };
    // Same loop as the clients: a blocking connect would never be accepted.
    let service = Service::advertise(
        &l,
        echo_protocol(),
        SERVICE,
        Rc::new(PathDirectory::new(dir.path())),
        config,
    )
    .unwrap();
    echo_handlers(&service);

    let opened = Rc::new(Cell::new(0));
    let sessions: Vec<Session> = (0..CLIENTS)
        .map(|_| {
            let session = client(&l, dir.path(), echo_protocol());
            let opened = Rc::clone(&opened);
            session
                .open(move |_, _, result| {
                    result.unwrap();
                    opened.set(opened.get() + 1);
                })
                .unwrap();
            session
        })
        .collect();

    assert!(pump_until(&l, || opened.get() == CLIENTS));
    assert!(sessions.iter().all(|s| s.state() == SessionState::Open));
    assert_eq!(service.sessions().len(), CLIENTS);
}

#[test]
fn flood_of_one_way_messages_is_bounded_and_ordered() {
    const SENT: u32 = 100;

    let dir = tempfile::tempdir().unwrap();
    init_test_tracing();
    let l = client_loop();
    let config = MessagingConfig {
        rx_queue_limit: 4,
        ..MessagingConfig::default()
    };
    let service = Service::advertise(
        &l,
        echo_protocol(),
        SERVICE,
        Rc::new(PathDirectory::new(dir.path())),
        config.clone(),
    )
    .unwrap();
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&got);
    service.set_receive_handler(move |_, _, msg| sink.borrow_mut().push(msg.msg_id()));

    let session = client(&l, dir.path(), echo_protocol());
    session.open_sync().unwrap();
    for id in 0..SENT {
        let mut msg = session.create_msg().unwrap();
        msg.set_msg_id(id);
        session.send(msg).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while got.borrow().len() < SENT as usize {
        assert!(Instant::now() < deadline, "flood not delivered");
        l.service_loop().unwrap();
        // Unread messages stay in the socket instead of the queue.
        assert!(service.pool().in_use() <= config.rx_queue_limit);
    }
    assert_eq!(*got.borrow(), (0..SENT).collect::<Vec<_>>());
}
