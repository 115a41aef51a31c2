use bytes::Bytes;
use cinderkv::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Start a one-worker server on a free local port
fn spawn_server() -> SocketAddr {
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let dispatcher: &'static Dispatcher = Box::leak(Box::new(Dispatcher::in_memory()));
    thread::spawn(move || net::run_server(addr, 1, dispatcher));
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server on {} never came up", addr);
}

fn cmd(parts: &[&str]) -> Bytes {
    Frame::command(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes()))).to_bytes()
}

/// Read exactly as many bytes as `expected` holds and compare
fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(String::from_utf8_lossy(&buf), String::from_utf8_lossy(expected));
}

#[test]
fn set_get_over_tcp() {
    let mut stream = connect(spawn_server());

    stream.write_all(&cmd(&["SET", "foo", "bar"])).unwrap();
    expect_reply(&mut stream, b"+OK\r\n");
    stream.write_all(&cmd(&["GET", "foo"])).unwrap();
    expect_reply(&mut stream, b"$3\r\nbar\r\n");
    stream.write_all(&cmd(&["GET", "nope"])).unwrap();
    expect_reply(&mut stream, b"$-1\r\n");
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let mut stream = connect(spawn_server());

    let mut batch = Vec::new();
    batch.extend_from_slice(&cmd(&["PING"]));
    batch.extend_from_slice(&cmd(&["HSET", "h", "f", "v"]));
    batch.extend_from_slice(&cmd(&["HGET", "h", "f"]));
    batch.extend_from_slice(&cmd(&["NOPE"]));
    batch.extend_from_slice(&cmd(&["TTL", "h"]));
    stream.write_all(&batch).unwrap();

    expect_reply(&mut stream, b"+PONG\r\n:1\r\n$1\r\nv\r\n-ERR unknown command 'NOPE'\r\n:-1\r\n");
}

#[test]
fn request_split_across_writes() {
    let mut stream = connect(spawn_server());
    let request = cmd(&["SET", "split", "value"]);
    let (head, tail) = request.split_at(9);

    stream.write_all(head).unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(tail).unwrap();
    expect_reply(&mut stream, b"+OK\r\n");
}

#[test]
fn large_value_round_trips() {
    let mut stream = connect(spawn_server());
    let value = vec![b'z'; 1024 * 1024];

    let set = Frame::command(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"big"), Bytes::from(value.clone())]);
    stream.write_all(&set.to_bytes()).unwrap();
    expect_reply(&mut stream, b"+OK\r\n");

    stream.write_all(&cmd(&["GET", "big"])).unwrap();
    expect_reply(&mut stream, &Frame::bulk(value).to_bytes());
}

#[test]
fn protocol_error_replies_then_closes() {
    let mut stream = connect(spawn_server());

    stream.write_all(b"*1\r\n$3\r\nfooXY").unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();

    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("-ERR Protocol error"), "{}", reply);
    assert!(reply.ends_with("\r\n"));
}
