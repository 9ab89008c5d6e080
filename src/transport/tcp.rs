//! TCP transport, non-blocking dialer and single-peer acceptor

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};

use super::{Connector, ReadMode, StreamSettings, Transport};
use crate::errors::{LinkError, Result};

/// Back-off between retries of a write that would block
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Established TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    settings: StreamSettings,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, settings: StreamSettings) -> Result<Self> {
        stream.set_nodelay(true)?;
        match settings.read_mode {
            ReadMode::Blocking { poll_timeout } => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(poll_timeout))?;
                stream.set_write_timeout(Some(settings.write_timeout))?;
            }
            ReadMode::NonBlocking => stream.set_nonblocking(true)?,
        }
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            stream,
            settings,
            peer,
        })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.stream.read(buffer) {
            Ok(0) => Err(LinkError::TransportFault(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.settings.write_timeout;
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(LinkError::TransportFault(format!(
                        "{} stopped accepting data",
                        self.peer
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if Instant::now() >= deadline {
                        return Err(LinkError::TransportFault(format!(
                            "write to {} stalled after {} of {} bytes",
                            self.peer,
                            written,
                            data.len()
                        )));
                    }
                    thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of {} failed: {}", self.peer, e);
        }
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(Self {
            stream: self.stream.try_clone()?,
            settings: self.settings,
            peer: self.peer.clone(),
        }))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Outbound connector that never blocks on `connect()`
pub struct TcpDialer {
    addr: SocketAddr,
    settings: StreamSettings,
    pending: Option<Socket>,
    relayed: bool,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr, settings: StreamSettings) -> Self {
        Self {
            addr,
            settings,
            pending: None,
            relayed: false,
        }
    }

    /// The address is a relay hub; the peer arrives through it in its own time
    pub fn via_relay(mut self) -> Self {
        self.relayed = true;
        self
    }

    fn start(&mut self) -> Result<Option<Box<dyn Transport>>> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        debug!("dialing {}", self.addr);
        match socket.connect(&self.addr.into()) {
            Ok(()) => self.finish(socket).map(Some),
            Err(e) if is_in_progress(&e) => {
                self.pending = Some(socket);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self, socket: Socket) -> Result<Box<dyn Transport>> {
        let stream: TcpStream = socket.into();
        info!("connected to {}", self.addr);
        Ok(Box::new(TcpTransport::new(stream, self.settings)?))
    }
}

impl Connector for TcpDialer {
    fn poll_connect(&mut self) -> Result<Option<Box<dyn Transport>>> {
        let socket = match self.pending.take() {
            Some(socket) => socket,
            None => return self.start(),
        };

        if let Some(err) = socket.take_error()? {
            return Err(err.into());
        }
        match socket.peer_addr() {
            Ok(_) => self.finish(socket).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                self.pending = Some(socket);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn abort(&mut self) {
        if self.pending.take().is_some() {
            debug!("abandoned pending connect to {}", self.addr);
        }
    }

    fn is_rendezvous(&self) -> bool {
        self.relayed
    }
}

#[cfg(unix)]
fn is_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn is_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Listening side for direct mode; hands out one peer at a time
pub struct TcpAcceptor {
    listener: TcpListener,
    settings: StreamSettings,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr, settings: StreamSettings) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self { listener, settings })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl Connector for TcpAcceptor {
    fn poll_connect(&mut self) -> Result<Option<Box<dyn Transport>>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                info!("accepted peer {}", addr);
                Ok(Some(Box::new(TcpTransport::new(stream, self.settings)?)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_passive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StreamSettings {
        StreamSettings {
            read_mode: ReadMode::Blocking {
                poll_timeout: Duration::from_millis(20),
            },
            write_timeout: Duration::from_millis(500),
        }
    }

    fn poll_until<T>(mut f: impl FnMut() -> Result<Option<T>>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = f().unwrap() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_dial_accept_and_exchange() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), settings()).unwrap();
        let mut dialer = TcpDialer::new(acceptor.local_addr().unwrap(), settings());

        let mut client = poll_until(|| dialer.poll_connect());
        let mut server = poll_until(|| acceptor.poll_connect());

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = server.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello");
    }

    #[test]
    fn test_idle_read_returns_zero_and_close_is_fault() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), settings()).unwrap();
        let mut dialer = TcpDialer::new(acceptor.local_addr().unwrap(), settings());
        let mut client = poll_until(|| dialer.poll_connect());
        let mut server = poll_until(|| acceptor.poll_connect());

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 0);

        client.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match server.read(&mut buf) {
                Err(e) => {
                    assert!(e.is_transport_fault());
                    break;
                }
                Ok(_) => assert!(Instant::now() < deadline, "close never observed"),
            }
        }
    }

    #[test]
    fn test_dial_refused_is_error() {
        // grab a free port, then release it so nothing listens there
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut dialer = TcpDialer::new(addr, settings());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match dialer.poll_connect() {
                Err(e) => {
                    assert!(e.is_transport_fault());
                    break;
                }
                Ok(Some(_)) => panic!("connected to a closed port"),
                Ok(None) => {
                    assert!(Instant::now() < deadline, "refusal never observed");
                    thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}
