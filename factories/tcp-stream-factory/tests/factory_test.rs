// Copyright 2020 Joyent, Inc.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;
use std::thread;

use slog::{o, Logger};
use uuid::Uuid;

use tcp_stream_factory::TcpStreamFactory;
use zkpool::config::{PoolOptions, ZkConnectString};
use zkpool::coordinator::memory::MemoryEnsemble;
use zkpool::factory::ObjectFactory;
use zkpool::ZkObjectPool;

// An echo server that serves every connection on its own thread.
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream: TcpStream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn create_validate_destroy() {
    let addr = echo_server();
    let factory = TcpStreamFactory::new(addr);

    let obj = factory.create().unwrap();
    assert_eq!(obj.addr(), addr);
    assert!(factory.validate(&obj).unwrap());
    factory.destroy(obj).unwrap();
}

#[test]
fn deserialize_reconnects_to_same_peer() {
    let addr = echo_server();
    let factory = TcpStreamFactory::new(addr);

    let obj = factory.create().unwrap();
    let data = factory.serialize(&obj).unwrap();
    assert_eq!(data, addr.to_string().into_bytes());

    let copy = factory.deserialize(&data).unwrap();
    assert_eq!(copy.peer_addr().unwrap(), addr);
    assert!(factory.deserialize(b"not an address").is_err());

    factory.destroy(obj).unwrap();
    factory.destroy(copy).unwrap();
}

#[test]
fn unreachable_peer_fails_create() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let factory = TcpStreamFactory::new(addr);
    assert!(factory.create().is_err());
}

#[test]
fn pooled_streams_carry_traffic() {
    let addr = echo_server();
    let ensemble = MemoryEnsemble::default();
    let mut options = PoolOptions::new(
        format!("tcp-{}", Uuid::new_v4()),
        ZkConnectString::from_str("127.0.0.1:2181").unwrap(),
        2,
    );
    options.init_size = Some(1);
    options.log = Some(Logger::root(slog::Discard, o!()));

    let pool = ZkObjectPool::new(options, ensemble, TcpStreamFactory::new(addr));
    pool.initialize().unwrap();

    let mut conn = pool.borrow().expect("borrow");
    conn.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    pool.return_object(conn);
    assert_eq!(pool.unused().unwrap(), 1);
    pool.shutdown().unwrap();
}
