mod common;

use common::{big_reply, command, config, Recorder, ScriptedPoller, Throttled};
use roma_server::reactor::{EventFlags, Mask, TimerId};
use roma_server::server::server_cron;
use roma_server::{BasicCommands, EventSource, Server};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

const NO_WAIT: EventFlags = EventFlags::FILE_EVENTS.union(EventFlags::DONT_WAIT);

#[test]
fn large_reply_drains_and_drops_write_interest_once() {
    let poller = ScriptedPoller::new();
    let (recorder, seen) = Recorder::new();
    let mut server: Server<Throttled> = Server::new(config(1), Box::new(recorder)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    let (stream, written) = Throttled::new(ours, 1000);
    let fd = stream.as_raw_fd();
    let id = server.create_client(&mut el, stream, None).unwrap();
    assert_eq!(poller.registered(fd), Mask::READABLE);

    peer.write_all(&command(&["BIG", "40000"])).unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(server.pending_write_len(), 1);

    // First flush happens before sleeping; the rest needs a write handler.
    server.handle_clients_with_pending_write(&mut el);
    assert_eq!(server.pending_write_len(), 0);
    assert_eq!(written.lock().unwrap().len(), 1000);
    assert!(el.file_event_mask(fd).contains(Mask::WRITABLE));

    poller.set_level_writable(true);
    let mut cycles = 0;
    while el.file_event_mask(fd).contains(Mask::WRITABLE) {
        el.process_events(&mut server, NO_WAIT);
        cycles += 1;
        assert!(cycles < 100, "reply never drained");
    }

    assert_eq!(*written.lock().unwrap(), big_reply(40000));
    assert_eq!(poller.writable_removals(fd), 1);
    assert_eq!(el.file_event_mask(fd), Mask::READABLE);
    assert!(!server.client(id).unwrap().has_pending_output());

    el.process_events(&mut server, NO_WAIT);
    assert_eq!(poller.writable_removals(fd), 1);
}

#[test]
fn replies_queued_while_draining_keep_their_order() {
    let poller = ScriptedPoller::new();
    let (recorder, _seen) = Recorder::new();
    let mut server: Server<Throttled> = Server::new(config(1), Box::new(recorder)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    let (stream, written) = Throttled::new(ours, 4096);
    let fd = stream.as_raw_fd();
    server.create_client(&mut el, stream, None).unwrap();

    peer.write_all(&command(&["BIG", "20000"])).unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    server.handle_clients_with_pending_write(&mut el);
    assert!(el.file_event_mask(fd).contains(Mask::WRITABLE));

    // More output while the write handler is installed.
    peer.write_all(&command(&["PING"])).unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    assert_eq!(server.pending_write_len(), 0);

    poller.set_level_writable(true);
    for _ in 0..50 {
        if !el.file_event_mask(fd).contains(Mask::WRITABLE) {
            break;
        }
        el.process_events(&mut server, NO_WAIT);
    }

    let mut expected = big_reply(20000);
    expected.extend_from_slice(b"+OK\r\n");
    assert_eq!(*written.lock().unwrap(), expected);
    assert_eq!(poller.writable_removals(fd), 1);
}

#[test]
fn protocol_error_replies_then_closes() {
    let poller = ScriptedPoller::new();
    let (recorder, seen) = Recorder::new();
    let mut server: Server<Throttled> = Server::new(config(1), Box::new(recorder)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    let (stream, written) = Throttled::new(ours, 4096);
    let fd = stream.as_raw_fd();
    server.create_client(&mut el, stream, None).unwrap();

    peer.write_all(b"*1048577\r\n*1\r\n$4\r\nPING\r\n").unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(server.client_count(), 1);

    server.handle_clients_with_pending_write(&mut el);
    assert_eq!(server.client_count(), 0);
    assert_eq!(poller.registered(fd), Mask::empty());
    assert_eq!(el.max_fd(), -1);
    assert_eq!(
        *written.lock().unwrap(),
        b"-ERR Protocol error: invalid multibulk length\r\n".to_vec()
    );
}

#[test]
fn quit_flushes_replies_then_closes() {
    let poller = ScriptedPoller::new();
    let mut server: Server<UnixStream> = Server::new(config(1), Box::new(BasicCommands)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = ours.as_raw_fd();
    server.create_client(&mut el, ours, None).unwrap();

    peer.write_all(b"PING\r\nECHO hi\r\nQUIT\r\nPING\r\n").unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    server.handle_clients_with_pending_write(&mut el);
    assert_eq!(server.client_count(), 0);

    let mut replies = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match peer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => replies.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    assert_eq!(replies, b"+PONG\r\n$2\r\nhi\r\n+OK\r\n".to_vec());
}

#[test]
fn eof_frees_the_client() {
    let poller = ScriptedPoller::new();
    let mut server: Server<UnixStream> = Server::new(config(1), Box::new(BasicCommands)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = ours.as_raw_fd();
    server.create_client(&mut el, ours, None).unwrap();
    assert_eq!(el.max_fd(), fd);

    drop(peer);
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    assert_eq!(server.client_count(), 0);
    assert_eq!(el.max_fd(), -1);
}

#[test]
fn query_buffer_limit_closes_client() {
    let poller = ScriptedPoller::new();
    let (recorder, seen) = Recorder::new();
    let mut cfg = config(1);
    cfg.max_query_buffer = 64 * 1024;
    let mut server: Server<UnixStream> = Server::new(cfg, Box::new(recorder)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = ours.as_raw_fd();
    server.create_client(&mut el, ours, None).unwrap();

    // A big argument that never completes within the limit.
    peer.write_all(b"*1\r\n$100000\r\n").unwrap();
    peer.write_all(&vec![b'x'; 90_000]).unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);
    // Reading stops past the limit; nothing is left queued for later.
    assert_eq!(server.pending_read_len(), 0);
    assert_eq!(server.client_count(), 1);

    roma_server::server::before_sleep(&mut el, &mut server);
    assert_eq!(server.client_count(), 0);
    assert!(seen.lock().unwrap().is_empty());

    let mut buf = [0u8; 256];
    let n = peer.read(&mut buf).unwrap();
    assert_eq!(
        &buf[..n],
        b"-ERR Protocol error: query buffer exceeded 65536 bytes\r\n"
    );
}

#[test]
fn output_limit_drops_the_client() {
    let poller = ScriptedPoller::new();
    let (recorder, seen) = Recorder::new();
    let mut cfg = config(1);
    cfg.max_reply_buffer = 1000;
    let mut server: Server<Throttled> = Server::new(cfg, Box::new(recorder)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    let (stream, written) = Throttled::new(ours, 4096);
    let fd = stream.as_raw_fd();
    server.create_client(&mut el, stream, None).unwrap();

    peer.write_all(&command(&["BIG", "5000"])).unwrap();
    poller.fire(fd, Mask::READABLE);
    el.process_events(&mut server, NO_WAIT);

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(server.client_count(), 0);
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn cron_closes_idle_clients() {
    let poller = ScriptedPoller::new();
    let mut cfg = config(1);
    cfg.client_idle_timeout_secs = 1;
    let mut server: Server<UnixStream> = Server::new(cfg, Box::new(BasicCommands)).unwrap();
    let mut el = server.event_loop_with(Box::new(poller.clone()));

    let (ours, _peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    server.create_client(&mut el, ours, None).unwrap();

    let next = server_cron(&mut el, &mut server, TimerId(0), EventSource::Cron);
    assert_eq!(next, Duration::from_millis(100));
    assert_eq!(server.client_count(), 1);

    thread::sleep(Duration::from_millis(1100));
    server_cron(&mut el, &mut server, TimerId(0), EventSource::Cron);
    assert_eq!(server.client_count(), 0);
}

#[test]
fn clients_beyond_the_descriptor_table_are_rejected() {
    let poller = ScriptedPoller::new();
    let mut cfg = config(1);
    cfg.max_clients = 1;
    let mut server: Server<UnixStream> = Server::new(cfg, Box::new(BasicCommands)).unwrap();
    // A table too small for any real descriptor.
    let mut el = roma_server::EventLoop::new(1, Box::new(poller));

    let (ours, mut peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let err = server.create_client(&mut el, ours, None).unwrap_err();
    assert!(matches!(err, roma_server::Error::FdOutOfRange { .. }));
    assert_eq!(server.client_count(), 0);

    let mut buf = [0u8; 64];
    let n = peer.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"-ERR max number of clients reached\r\n");
}
