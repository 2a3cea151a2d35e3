mod common;

use common::{any_port, manager, wait_for};
use netmgr_core::{Counter, Handle, NetError, TaskStatus};

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;

fn echo(handle: &Handle, result: Result<&[u8], NetError>) {
    if let Ok(msg) = result {
        handle.send(msg, |_, _| {});
    }
}

#[test]
fn listener_echoes_datagrams() {
    let mgr = manager(2);
    let listener = mgr.listen_udp(any_port(), echo).unwrap();
    assert_eq!(listener.nchildren(), 2);
    let addr = listener.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let client = UdpSocket::bind(any_port()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 64];
    for msg in [&b"one"[..], b"two", b"three"] {
        client.send_to(msg, addr).unwrap();
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg);
        assert_eq!(from, addr);
    }
    assert!(mgr.stats().get(Counter::UdpOpen) >= 2);

    drop(listener);
    mgr.destroy();
}

#[test]
fn client_reads_one_reply() {
    let mgr = manager(1);
    let listener = mgr.listen_udp(any_port(), echo).unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.udp_connect(
        None,
        addr,
        move |result| {
            let handle = result.unwrap();
            handle.read(move |_, result| {
                tx.send(result.map(|msg| msg.to_vec())).unwrap();
            });
            handle.send(b"ping", |_, result| assert!(result.is_ok()));
        },
        1000,
    );
    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.unwrap(), b"ping");

    drop(listener);
    mgr.destroy();
}

#[test]
fn client_read_times_out() {
    let mgr = manager(1);
    // bound but never answers
    let silent = UdpSocket::bind(any_port()).unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.udp_connect(
        None,
        silent.local_addr().unwrap(),
        move |result| {
            let handle = result.unwrap();
            handle.read(move |_, result| {
                tx.send(result.map(|msg| msg.to_vec())).unwrap();
            });
        },
        100,
    );
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Err(NetError::TimedOut));
    mgr.destroy();
}

#[test]
fn oversized_datagrams_are_dropped() {
    let mgr = manager(1);
    mgr.set_max_udp(8);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let listener = mgr
        .listen_udp(any_port(), move |_, result| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let client = UdpSocket::bind(any_port()).unwrap();
    client.send_to(&[0u8; 32], addr).unwrap();
    client.send_to(&[0u8; 4], addr).unwrap();
    wait_for(|| received.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(received.load(Ordering::SeqCst), 1);

    drop(listener);
    mgr.destroy();
}

#[test]
fn stopped_listener_closes_children() {
    let mgr = manager(2);
    let listener = mgr.listen_udp(any_port(), echo).unwrap();
    listener.stop_listening();
    wait_for(|| listener.is_closed());
    drop(listener);
    mgr.destroy();
}

#[test]
fn client_recovers_from_read_timeout() {
    let mgr = manager(1);
    let peer = UdpSocket::bind(any_port()).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.udp_connect(
        None,
        peer.local_addr().unwrap(),
        move |result| {
            let handle = result.unwrap();
            handle.read(move |handle, result| {
                if matches!(result, Err(NetError::TimedOut)) {
                    // keep waiting for the answer
                    handle.set_timeout(100);
                }
                let _ = tx.send(result.map(|msg| msg.to_vec()));
            });
            handle.send(b"ping", |_, _| {});
        },
        100,
    );
    let mut buf = [0u8; 16];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Err(NetError::TimedOut));

    // answer only after the first timeout
    peer.send_to(&buf[..n], from).unwrap();
    let reply = loop {
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Err(NetError::TimedOut) => continue,
            other => break other,
        }
    };
    assert_eq!(reply.unwrap(), b"ping");
    mgr.destroy();
}

#[test]
fn datagrams_wait_while_worker_paused() {
    let mgr = manager(1);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let listener = mgr
        .listen_udp(any_port(), move |_, result| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let client = UdpSocket::bind(any_port()).unwrap();
    client.send_to(b"first", addr).unwrap();
    wait_for(|| received.load(Ordering::SeqCst) == 1);

    let (tx, rx) = channel::unbounded();
    let m = mgr.clone();
    mgr.task_enqueue(
        move || {
            m.pause();
            tx.send(()).unwrap();
            TaskStatus::Done
        },
        None,
    );
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(mgr.is_paused());

    client.send_to(b"second", addr).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(received.load(Ordering::SeqCst), 1);

    mgr.resume();
    wait_for(|| received.load(Ordering::SeqCst) == 2);

    drop(listener);
    mgr.destroy();
}

#[test]
fn sends_wait_for_resume() {
    let mgr = manager(4);
    let listener = mgr.listen_udp(any_port(), echo).unwrap();
    assert_eq!(listener.nchildren(), 4);
    let peer = UdpSocket::bind(any_port()).unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.udp_connect(
        None,
        peer.local_addr().unwrap(),
        move |result| tx.send(result.unwrap().clone()).unwrap(),
        1000,
    );
    let handle: Handle = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    mgr.pause();
    assert!(mgr.is_paused());
    let sent = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&sent);
    handle.send(b"held", move |_, result| {
        assert!(result.is_ok());
        done.fetch_add(1, Ordering::SeqCst);
    });
    let mut buf = [0u8; 16];
    peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    assert!(peer.recv_from(&mut buf).is_err());
    assert_eq!(sent.load(Ordering::SeqCst), 0);

    mgr.resume();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"held");
    wait_for(|| sent.load(Ordering::SeqCst) == 1);

    drop(handle);
    drop(listener);
    mgr.destroy();
}
