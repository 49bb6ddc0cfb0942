//! Robot-side session: connects to the simulator, writes sense, camera and value data and
//! reads effector data each cycle.

use tracing::{info, warn};

use crate::device::DeviceKind;
use crate::error::Error;
use crate::exchange::{self, Exchange, Message, MessageBuffer};
use crate::handshake::{self, HandshakeReport};
use crate::peer::Peer;
use crate::protocol::ExchangeSignal;
use crate::registry::{Registry, Side};

/// Client session context. Owns the registry and the single connection to the server.
#[derive(Debug)]
pub struct BbdClient {
    registry: Registry,
    peer: Option<Peer>,
    signal: ExchangeSignal,
    report: Option<HandshakeReport>,
    messages: MessageBuffer,
}

impl BbdClient {
    pub fn new(registry: Registry) -> Self {
        debug_assert_eq!(registry.side(), Side::Client);
        Self {
            registry,
            peer: None,
            signal: ExchangeSignal::default(),
            report: None,
            messages: MessageBuffer::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fill outgoing payloads or read effector results between cycle calls.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Result of the last handshake.
    pub fn report(&self) -> Option<&HandshakeReport> {
        self.report.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.as_ref().is_some_and(|p| !p.is_closed())
    }

    /// Connect to the server and reconcile every kind list. Mismatches come back in the
    /// report; the server decides whether the session goes on.
    pub fn connect(&mut self, host: &str, port: u16, buffer_size: usize) -> Result<&HandshakeReport, Error> {
        let mut peer = Peer::connect(host, port, buffer_size)?;
        let report = handshake::join(&mut self.registry, &mut peer)?;
        if !report.is_established() {
            warn!(mismatches = report.mismatches(), "handshake did not match every device");
        }
        self.peer = Some(peer);
        Ok(self.report.insert(report))
    }

    /// Connect only to tell the server this client cannot start, then hang up.
    pub fn refuse(host: &str, port: u16, buffer_size: usize, reason: i32) -> Result<(), Error> {
        let mut peer = Peer::connect(host, port, buffer_size)?;
        handshake::refuse_session(&mut peer, reason)?;
        info!(reason, "session refused");
        peer.close()?;
        Ok(())
    }

    fn peer(&mut self) -> Result<&mut Peer, Error> {
        match self.peer.as_mut() {
            Some(p) if !p.is_closed() => Ok(p),
            _ => Err(Error::NotConnected),
        }
    }

    fn write_kind(&mut self, kind: DeviceKind) -> Result<Exchange, Error> {
        let peer = match self.peer.as_mut() {
            Some(p) if !p.is_closed() => p,
            _ => return Err(Error::NotConnected),
        };
        let handles = self.registry.handles(kind).to_vec();
        exchange::write_devices(&self.registry, &handles, peer)?;
        Ok(Exchange::Completed)
    }

    pub fn write_senses(&mut self) -> Result<Exchange, Error> {
        self.write_kind(DeviceKind::Sense)
    }

    /// `kind` must be one of the camera kinds.
    pub fn write_cameras(&mut self, kind: DeviceKind) -> Result<Exchange, Error> {
        debug_assert!(kind.is_camera());
        self.write_kind(kind)
    }

    pub fn write_values(&mut self) -> Result<Exchange, Error> {
        self.write_kind(DeviceKind::Value)
    }

    /// Read this cycle's effector data. A terminate from the server closes the session.
    pub fn read_effectors(&mut self) -> Result<Exchange, Error> {
        let peer = match self.peer.as_mut() {
            Some(p) if !p.is_closed() => p,
            _ => return Err(Error::NotConnected),
        };
        let handles = self.registry.handles(DeviceKind::Effector).to_vec();
        let out = exchange::read_devices(&mut self.registry, &handles, peer, &mut self.signal)?;
        if out.is_terminated() {
            peer.close()?;
        }
        Ok(out)
    }

    /// Queue an event for the server; it is read ahead of the next control code.
    pub fn signal_event(&mut self, code: u32) -> Result<(), Error> {
        self.peer()?.send_event(code)?;
        Ok(())
    }

    /// Collect events the server sent since the last call.
    pub fn poll_events(&mut self, blocking: bool) -> Result<ExchangeSignal, Error> {
        let Self { peer, signal, .. } = self;
        match peer.as_mut() {
            Some(p) if !p.is_closed() => p.poll_events(signal, blocking)?,
            _ => return Err(Error::NotConnected),
        }
        Ok(signal.take())
    }

    pub fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        exchange::send_message(self.peer()?, message)
    }

    pub fn recv_message(&mut self) -> Result<Message<'_>, Error> {
        let Self {
            peer,
            signal,
            messages,
            ..
        } = self;
        match peer.as_mut() {
            Some(p) if !p.is_closed() => exchange::recv_message(p, signal, messages),
            _ => Err(Error::NotConnected),
        }
    }

    /// Tell the server this client is stopping, then close.
    pub fn terminate(&mut self, reason: i32) -> Result<(), Error> {
        let peer = self.peer()?;
        peer.send_terminate(reason)?;
        info!(reason, "session terminated");
        peer.close()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(peer) = self.peer.as_mut() {
            peer.close()?;
        }
        Ok(())
    }
}

impl Drop for BbdClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
