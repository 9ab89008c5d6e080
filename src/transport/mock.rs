//! In-memory transport and scripted connector for tests and simulations

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Connector, Transport};
use crate::errors::{LinkError, Result};

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory byte pipe
///
/// Clones share the same pipes and fault switch, like a cloned socket.
#[derive(Clone)]
pub struct MockTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockTransport {
    /// Unconnected endpoint; feed it with `inject` and drain it with `take_written`
    pub fn new() -> Self {
        Self {
            inbound: Arc::new(Mutex::new(Pipe::default())),
            outbound: Arc::new(Mutex::new(Pipe::default())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Two endpoints wired back to back
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        let a = Self {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            fail_writes: Arc::new(AtomicBool::new(false)),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            fail_writes: Arc::new(AtomicBool::new(false)),
        };
        (a, b)
    }

    /// Make bytes available to this endpoint's reader
    pub fn inject(&self, data: &[u8]) {
        self.inbound.lock().data.extend(data);
    }

    /// Drain everything this endpoint wrote that nobody has read yet
    pub fn take_written(&self) -> Vec<u8> {
        self.outbound.lock().data.drain(..).collect()
    }

    /// Make subsequent writes fail with a transport fault
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.lock().closed || self.outbound.lock().closed
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut pipe = self.inbound.lock();
        if pipe.data.is_empty() && pipe.closed {
            return Err(LinkError::TransportFault("mock peer closed".to_string()));
        }
        let n = pipe.data.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(pipe.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::TransportFault("mock write failure".to_string()));
        }
        let mut pipe = self.outbound.lock();
        if pipe.closed {
            return Err(LinkError::TransportFault("mock pipe closed".to_string()));
        }
        pipe.data.extend(data);
        Ok(())
    }

    fn close(&mut self) {
        self.inbound.lock().closed = true;
        self.outbound.lock().closed = true;
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}

/// One scripted outcome of `poll_connect`
pub enum ConnectStep {
    /// Report "still pending" once
    Pending,
    /// Report "still pending" until the session aborts the attempt
    Stall,
    /// Fail the attempt
    Fail(String),
    /// Hand out this transport
    Ready(MockTransport),
}

#[derive(Default)]
struct ConnectorInner {
    script: VecDeque<ConnectStep>,
    polls: u32,
    aborts: u32,
    passive: bool,
    rendezvous: bool,
}

/// Connector replaying a script; an exhausted script fails every poll
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Mutex<ConnectorInner>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that succeeds immediately with `transport`
    pub fn ready(transport: MockTransport) -> Self {
        let connector = Self::new();
        connector.push(ConnectStep::Ready(transport));
        connector
    }

    /// Behave like a listening socket (idle timeouts are not failures)
    pub fn passive(self) -> Self {
        self.inner.lock().passive = true;
        self
    }

    /// Behave like a relay dial (the peer may join after the transport)
    pub fn rendezvous(self) -> Self {
        self.inner.lock().rendezvous = true;
        self
    }

    pub fn push(&self, step: ConnectStep) {
        self.inner.lock().script.push_back(step);
    }

    /// Number of `poll_connect` calls so far
    pub fn polls(&self) -> u32 {
        self.inner.lock().polls
    }

    pub fn aborts(&self) -> u32 {
        self.inner.lock().aborts
    }
}

impl Connector for MockConnector {
    fn poll_connect(&mut self) -> Result<Option<Box<dyn Transport>>> {
        let mut inner = self.inner.lock();
        inner.polls += 1;
        if matches!(inner.script.front(), Some(ConnectStep::Stall)) {
            return Ok(None);
        }
        match inner.script.pop_front() {
            Some(ConnectStep::Ready(transport)) => Ok(Some(Box::new(transport))),
            Some(ConnectStep::Pending) | Some(ConnectStep::Stall) => Ok(None),
            Some(ConnectStep::Fail(reason)) => Err(LinkError::TransportFault(reason)),
            None => Err(LinkError::TransportFault("mock peer unreachable".to_string())),
        }
    }

    fn abort(&mut self) {
        let mut inner = self.inner.lock();
        inner.aborts += 1;
        if matches!(inner.script.front(), Some(ConnectStep::Stall)) {
            inner.script.pop_front();
        }
    }

    fn is_passive(&self) -> bool {
        self.inner.lock().passive
    }

    fn is_rendezvous(&self) -> bool {
        self.inner.lock().rendezvous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = MockTransport::pair();
        a.write_all(b"ping").unwrap();
        b.write_all(b"pong").unwrap();

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(a.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_faults_peer_after_drain() {
        let (mut a, mut b) = MockTransport::pair();
        a.write_all(b"x").unwrap();
        a.close();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 1);
        assert!(b.read(&mut buf).unwrap_err().is_transport_fault());
        assert!(b.write_all(b"y").is_err());
    }

    #[test]
    fn test_fail_writes_shared_by_clones() {
        let endpoint = MockTransport::new();
        let mut clone = endpoint.try_clone().unwrap();
        endpoint.set_fail_writes(true);
        assert!(clone.write_all(b"z").is_err());
    }

    #[test]
    fn test_connector_script() {
        let mut connector = MockConnector::new();
        connector.push(ConnectStep::Pending);
        connector.push(ConnectStep::Fail("refused".into()));
        connector.push(ConnectStep::Ready(MockTransport::new()));

        assert!(connector.poll_connect().unwrap().is_none());
        assert!(connector.poll_connect().is_err());
        assert!(connector.poll_connect().unwrap().is_some());
        assert!(connector.poll_connect().is_err());
        assert_eq!(connector.polls(), 4);
    }

    #[test]
    fn test_stall_until_abort() {
        let mut connector = MockConnector::new();
        connector.push(ConnectStep::Stall);
        connector.push(ConnectStep::Ready(MockTransport::new()));
        for _ in 0..5 {
            assert!(connector.poll_connect().unwrap().is_none());
        }
        connector.abort();
        assert!(connector.poll_connect().unwrap().is_some());
    }
}
