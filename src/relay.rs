//! Relay hub for hub-relayed mode
//!
//! Both devices dial the hub instead of each other. The hub pairs
//! connections in arrival order and forwards bytes both ways without
//! looking at them; framing, ordering and liveness stay end to end.
//!
//! A pair lives until either direction ends. Dropping both sockets then
//! lets the surviving device notice, reconnect and be paired again.
//!
//! A device that hangs up while waiting for its partner is dropped from the
//! waiting slot before the next arrival is paired, so a redial never lands
//! on its own dead socket.
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use crate::errors::{LinkError, Result};

/// How long the reactor gets to report a hang-up on the waiting socket
const HANGUP_GRACE: Duration = Duration::from_millis(10);

/// A device connected to the hub with no partner yet
struct Waiting {
    stream: TcpStream,
    addr: SocketAddr,
    /// Bytes it sent before pairing, forwarded once a partner arrives
    early: Vec<u8>,
}

impl Waiting {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            early: Vec::new(),
        }
    }

    /// Drain what the device already sent; false once it has hung up
    async fn is_alive(&mut self) -> bool {
        let mut chunk = [0u8; 512];
        loop {
            if time::timeout(HANGUP_GRACE, self.stream.readable()).await.is_err() {
                return true;
            }
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.early.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    debug!("relay: waiting peer {} failed: {}", self.addr, e);
                    return false;
                }
            }
        }
    }
}

pub struct RelayHub {
    listener: TcpListener,
}

impl RelayHub {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("relay listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and pair peers until the task is dropped
    pub async fn run(self) -> Result<()> {
        let mut waiting: Option<Waiting> = None;
        let mut pairs = 0u64;

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("relay accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("nodelay on {} failed: {}", addr, e);
            }

            let mut partner = waiting.take();
            if let Some(first) = partner.as_mut() {
                if !first.is_alive().await {
                    info!("relay: {} hung up while waiting", first.addr);
                    partner = None;
                }
            }

            match partner {
                None => {
                    info!("relay: {} waiting for a partner", addr);
                    waiting = Some(Waiting::new(stream, addr));
                }
                Some(first) => {
                    pairs += 1;
                    info!("relay: pair {} is {} <-> {}", pairs, first.addr, addr);
                    tokio::spawn(async move {
                        let forwarded = bridge(first, stream).await;
                        info!(
                            "relay: pair {} closed after {} bytes",
                            pairs, forwarded
                        );
                    });
                }
            }
        }
    }
}

/// Forward both ways until either direction ends; returns bytes forwarded
async fn bridge(first: Waiting, b: TcpStream) -> u64 {
    let (mut a_read, mut a_write) = first.stream.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    if !first.early.is_empty() {
        if let Err(e) = b_write.write_all(&first.early).await {
            debug!("relay: early bytes to {} failed: {}", first.addr, e);
            return 0;
        }
    }

    let result = tokio::select! {
        r = io::copy(&mut a_read, &mut b_write) => r,
        r = io::copy(&mut b_read, &mut a_write) => r,
    };

    // best effort; the peers learn about the drop from EOF either way
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    match result {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("relay: pair ended with {}", e);
            0
        }
    }
}

/// Run a hub on a fresh multi-threaded runtime until Ctrl-C
pub fn run_until_interrupted(addr: SocketAddr) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| LinkError::Runtime(format!("failed to start runtime: {}", e)))?;

    runtime.block_on(async move {
        let hub = RelayHub::bind(addr).await?;
        tokio::select! {
            result = hub.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("relay interrupted, shutting down");
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pairs_and_forwards_both_ways() {
        let hub = RelayHub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = hub.local_addr().unwrap();
        tokio::spawn(hub.run());

        let mut controller = TcpStream::connect(addr).await.unwrap();
        let mut receiver = TcpStream::connect(addr).await.unwrap();

        controller.write_all(b"angle").await.unwrap();
        let mut buf = [0u8; 5];
        receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"angle");

        receiver.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        controller.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_close_drops_partner_and_repairs() {
        let hub = RelayHub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = hub.local_addr().unwrap();
        tokio::spawn(hub.run());

        let first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        // make sure the pair is formed before closing
        let mut talker = first;
        talker.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        second.read_exact(&mut one).await.unwrap();
        drop(talker);

        let mut rest = Vec::new();
        let n = second.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        let mut third = TcpStream::connect(addr).await.unwrap();
        let mut fourth = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"y").await.unwrap();
        fourth.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"y");
    }

    #[tokio::test]
    async fn test_hung_up_waiter_is_not_paired() {
        let hub = RelayHub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = hub.local_addr().unwrap();
        tokio::spawn(hub.run());

        let stale = TcpStream::connect(addr).await.unwrap();
        drop(stale);
        time::sleep(Duration::from_millis(50)).await;

        let mut redialed = TcpStream::connect(addr).await.unwrap();
        let mut partner = TcpStream::connect(addr).await.unwrap();

        redialed.write_all(b"hs").await.unwrap();
        let mut buf = [0u8; 2];
        partner.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hs");

        partner.write_all(b"ok").await.unwrap();
        redialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_bytes_sent_before_pairing_are_forwarded() {
        let hub = RelayHub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = hub.local_addr().unwrap();
        tokio::spawn(hub.run());

        let mut early = TcpStream::connect(addr).await.unwrap();
        early.write_all(b"handshake").await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let mut late = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 9];
        late.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"handshake");
    }
}
