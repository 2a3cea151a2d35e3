mod common;

use common::{any_port, frame, init_logging, manager, wait_for};
use netmgr_core::config::default_config;
use netmgr_core::{Handle, Manager, NetError};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel;

fn echo(handle: &Handle, result: Result<&[u8], NetError>) {
    if let Ok(msg) = result {
        handle.send(msg, |_, _| {});
    }
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).unwrap();
    let mut msg = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut msg).unwrap();
    msg
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

#[test]
fn pipelined_messages_echo_in_order() {
    let mgr = manager(2);
    let listener = mgr.listen_tcpdns(any_port(), echo, |_| Ok(()), None).unwrap();
    let mut stream = connect(listener.local_addr().unwrap());

    let mut wire = frame(b"first");
    wire.extend(frame(b"second"));
    wire.extend(frame(b""));
    // split a frame across writes
    let third = frame(b"third");
    wire.extend_from_slice(&third[..3]);
    stream.write_all(&wire).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(&third[3..]).unwrap();

    assert_eq!(read_frame(&mut stream), b"first");
    assert_eq!(read_frame(&mut stream), b"second");
    assert_eq!(read_frame(&mut stream), b"");
    assert_eq!(read_frame(&mut stream), b"third");

    drop(stream);
    drop(listener);
    mgr.destroy();
}

#[test]
fn outstanding_requests_pause_reading() {
    init_logging();
    let mut config = default_config();
    config.nworkers = 1;
    config.tcp.pipeline_limit = 1;
    let mgr = Manager::from_config(&config);

    let held: Arc<Mutex<Vec<Handle>>> = Arc::default();
    let received = Arc::new(AtomicUsize::new(0));
    let (keep, count) = (Arc::clone(&held), Arc::clone(&received));
    let listener = mgr
        .listen_tcpdns(
            any_port(),
            move |handle, result| {
                if result.is_ok() {
                    keep.lock().unwrap().push(handle.clone());
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            |_| Ok(()),
            None,
        )
        .unwrap();
    let mut stream = connect(listener.local_addr().unwrap());
    let wire: Vec<u8> = (0..3u8).flat_map(|i| frame(&[i])).collect();
    stream.write_all(&wire).unwrap();

    wait_for(|| received.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // answering a request lets the next one in
    let first = held.lock().unwrap().remove(0);
    first.send(b"done", |_, _| {});
    drop(first);
    assert_eq!(read_frame(&mut stream), b"done");
    wait_for(|| received.load(Ordering::SeqCst) == 2);

    held.lock().unwrap().clear();
    wait_for(|| received.load(Ordering::SeqCst) == 3);

    held.lock().unwrap().clear();
    drop(stream);
    drop(listener);
    mgr.destroy();
}

#[test]
fn client_reads_one_message_per_read() {
    let mgr = manager(1);
    let listener = mgr.listen_tcpdns(any_port(), echo, |_| Ok(()), None).unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.tcpdns_connect(
        None,
        addr,
        move |result| {
            let handle = result.unwrap().clone();
            let first = tx.clone();
            handle.read(move |handle, result| {
                first.send(result.map(|msg| msg.to_vec())).unwrap();
                let second = first.clone();
                handle.read(move |_, result| {
                    second.send(result.map(|msg| msg.to_vec())).unwrap();
                });
            });
            handle.send(b"query one", |_, result| assert!(result.is_ok()));
            handle.send(b"query two", |_, result| assert!(result.is_ok()));
        },
        1000,
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(),
        b"query one"
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(),
        b"query two"
    );

    drop(listener);
    mgr.destroy();
}

#[test]
fn oversized_message_is_refused() {
    let mgr = manager(1);
    let listener = mgr.listen_tcpdns(any_port(), echo, |_| Ok(()), None).unwrap();

    let (tx, rx) = channel::unbounded();
    mgr.tcpdns_connect(
        None,
        listener.local_addr().unwrap(),
        move |result| {
            let handle = result.unwrap();
            handle.send(&vec![0u8; 70_000], move |_, result| tx.send(result).unwrap());
        },
        1000,
    );
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Err(NetError::TooLarge));

    drop(listener);
    mgr.destroy();
}
