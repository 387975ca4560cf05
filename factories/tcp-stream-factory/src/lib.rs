// Copyright 2020 Joyent, Inc.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::ops::{Deref, DerefMut};
use std::str;
use std::time::Duration;

use zkpool::factory::{FactoryError, ObjectFactory};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A pooled TCP connection. The pool stores only the peer address, so a
/// participant borrowing the object gets a fresh connection to the same
/// peer.
#[derive(Debug)]
pub struct TcpStreamWrapper {
    pub stream: TcpStream,
    addr: SocketAddr,
}

impl TcpStreamWrapper {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Deref for TcpStreamWrapper {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream
    }
}

impl DerefMut for TcpStreamWrapper {
    fn deref_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

#[derive(Clone, Debug)]
pub struct TcpStreamFactory {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpStreamFactory {
    pub fn new(addr: SocketAddr) -> Self {
        TcpStreamFactory {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn connect(&self, addr: SocketAddr) -> Result<TcpStreamWrapper, FactoryError> {
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(FactoryError::failed)?;
        Ok(TcpStreamWrapper { stream, addr })
    }
}

impl ObjectFactory for TcpStreamFactory {
    type Object = TcpStreamWrapper;

    fn create(&self) -> Result<TcpStreamWrapper, FactoryError> {
        self.connect(self.addr)
    }

    fn validate(&self, obj: &TcpStreamWrapper) -> Result<bool, FactoryError> {
        if obj.stream.peer_addr().is_err() {
            return Ok(false);
        }
        match obj.stream.take_error() {
            Ok(None) => Ok(true),
            Ok(Some(_)) | Err(_) => Ok(false),
        }
    }

    fn destroy(&self, obj: TcpStreamWrapper) -> Result<(), FactoryError> {
        match obj.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(FactoryError::zombie(format!(
                "unable to shut down stream to {}: {}",
                obj.addr, e
            ))),
        }
    }

    fn serialize(&self, obj: &TcpStreamWrapper) -> Result<Vec<u8>, FactoryError> {
        Ok(obj.addr.to_string().into_bytes())
    }

    fn deserialize(&self, data: &[u8]) -> Result<TcpStreamWrapper, FactoryError> {
        let addr = str::from_utf8(data)
            .map_err(FactoryError::failed)?
            .parse::<SocketAddr>()
            .map_err(FactoryError::failed)?;
        self.connect(addr)
    }
}
