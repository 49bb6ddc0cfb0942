//! Simulator-side session: listens once per remote host, reads sense, camera and value
//! data and writes effector data each cycle.

use tracing::{debug, info, warn};

use crate::channel::{AccessMethod, BufferedChannel, ChannelSpec, Direction};
use crate::device::DeviceKind;
use crate::error::Error;
use crate::exchange::{self, Exchange, Message, MessageBuffer};
use crate::handshake::{self, HandshakeState};
use crate::peer::{HostFlags, Peer};
use crate::protocol::ExchangeSignal;
use crate::registry::{HostId, Registry, Side};

#[derive(Debug)]
struct HostLink {
    listener: Option<BufferedChannel>,
    peer: Option<Peer>,
    state: HandshakeState,
}

impl HostLink {
    fn live_peer(&mut self) -> Option<&mut Peer> {
        self.peer.as_mut().filter(|p| !p.is_closed())
    }
}

/// Server session context. Owns the registry and one link per remote host.
#[derive(Debug)]
pub struct BbdServer {
    registry: Registry,
    links: Vec<HostLink>,
    signal: ExchangeSignal,
    buffer_size: usize,
    messages: MessageBuffer,
}

impl BbdServer {
    /// Bind a listening socket for every remote host. A port already in use comes back
    /// as a retryable transport error.
    pub fn bind(registry: Registry, buffer_size: usize) -> Result<Self, Error> {
        debug_assert_eq!(registry.side(), Side::Server);
        let mut links = Vec::with_capacity(registry.host_count());
        for (_, host) in registry.hosts() {
            let spec = ChannelSpec::new(host.listen_name(), Direction::Read, AccessMethod::Listen)
                .with_buffer_size(buffer_size);
            let listener = BufferedChannel::allocate(spec)?;
            debug!(host = %host.host, port = ?listener.local_port(), "listening");
            links.push(HostLink {
                listener: Some(listener),
                peer: None,
                state: HandshakeState::Idle,
            });
        }
        Ok(Self {
            registry,
            links,
            signal: ExchangeSignal::default(),
            buffer_size,
            messages: MessageBuffer::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Port a host's listener is bound to.
    pub fn local_port(&self, host: HostId) -> Option<u16> {
        self.links
            .get(host.index())
            .and_then(|l| l.listener.as_ref())
            .and_then(|l| l.local_port())
    }

    pub fn handshake_state(&self, host: HostId) -> HandshakeState {
        self.links
            .get(host.index())
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// Accept one connection per host, in host order, and run the handshake on each.
    pub fn accept(&mut self) -> Result<(), Error> {
        let hosts: Vec<HostId> = self.registry.hosts().map(|(id, _)| id).collect();
        for id in hosts {
            let link = &mut self.links[id.index()];
            if link.peer.is_some() {
                continue;
            }
            let Some(mut listener) = link.listener.take() else {
                return Err(Error::NotConnected);
            };
            listener.open()?;
            let mut peer = Peer::from_stream(listener, self.buffer_size)?;
            let outcome = handshake::serve(&mut self.registry, id, &mut peer, &mut link.state);
            link.peer = Some(peer);
            outcome?;
        }
        info!(hosts = self.links.len(), "all hosts connected");
        Ok(())
    }

    fn read_kind(&mut self, kind: DeviceKind) -> Result<Exchange, Error> {
        for i in 0..self.links.len() {
            let handles = self.registry.host_handles(kind, HostId(i));
            if handles.is_empty() {
                continue;
            }
            let Some(peer) = self.links[i].live_peer() else {
                return Err(Error::NotConnected);
            };
            let out = exchange::read_devices(&mut self.registry, &handles, peer, &mut self.signal)?;
            if out.is_terminated() {
                peer.close()?;
                return Ok(out);
            }
        }
        Ok(Exchange::Completed)
    }

    pub fn read_senses(&mut self) -> Result<Exchange, Error> {
        self.read_kind(DeviceKind::Sense)
    }

    /// `kind` must be one of the camera kinds.
    pub fn read_cameras(&mut self, kind: DeviceKind) -> Result<Exchange, Error> {
        debug_assert!(kind.is_camera());
        self.read_kind(kind)
    }

    pub fn read_values(&mut self) -> Result<Exchange, Error> {
        self.read_kind(DeviceKind::Value)
    }

    /// Write this cycle's effector data, flushing each host after its devices.
    pub fn write_effectors(&mut self) -> Result<Exchange, Error> {
        for i in 0..self.links.len() {
            let handles = self.registry.host_handles(DeviceKind::Effector, HostId(i));
            if handles.is_empty() {
                continue;
            }
            let Some(peer) = self.links[i].live_peer() else {
                return Err(Error::NotConnected);
            };
            if exchange::write_devices(&self.registry, &handles, peer)? > 0 {
                peer.flags.insert(HostFlags::EFFECTOR_TRAFFIC);
            }
        }
        Ok(Exchange::Completed)
    }

    /// Collect events from every host. Hosts in `blocking` are waited on; the rest are
    /// only checked. Returns the accumulated word and clears it.
    pub fn poll_events(&mut self, blocking: &[HostId]) -> Result<ExchangeSignal, Error> {
        for (i, link) in self.links.iter_mut().enumerate() {
            if let Some(peer) = link.live_peer() {
                peer.poll_events(&mut self.signal, blocking.contains(&HostId(i)))?;
            }
        }
        Ok(self.signal.take())
    }

    /// Send an event to every connected host.
    pub fn signal_event(&mut self, code: u32) -> Result<(), Error> {
        for link in &mut self.links {
            if let Some(peer) = link.live_peer() {
                peer.send_event(code)?;
            }
        }
        Ok(())
    }

    fn peer(&mut self, host: HostId) -> Result<&mut Peer, Error> {
        self.links
            .get_mut(host.index())
            .and_then(HostLink::live_peer)
            .ok_or(Error::NotConnected)
    }

    pub fn send_message(&mut self, host: HostId, message: &[u8]) -> Result<(), Error> {
        exchange::send_message(self.peer(host)?, message)
    }

    pub fn recv_message(&mut self, host: HostId) -> Result<Message<'_>, Error> {
        let peer = self
            .links
            .get_mut(host.index())
            .and_then(HostLink::live_peer)
            .ok_or(Error::NotConnected)?;
        exchange::recv_message(peer, &mut self.signal, &mut self.messages)
    }

    /// Stop unilaterally: send the terminate code and `reason` to every host that has
    /// carried effector traffic, then close every link.
    pub fn terminate(&mut self, reason: i32) -> Result<(), Error> {
        let mut first_err = None;
        for link in &mut self.links {
            let Some(peer) = link.live_peer() else {
                continue;
            };
            if !peer.flags.contains(HostFlags::EFFECTOR_TRAFFIC) {
                continue;
            }
            if let Err(e) = peer.send_terminate(reason) {
                warn!(error = %e, "terminate not delivered");
                first_err.get_or_insert(Error::from(e));
            }
        }
        info!(reason, "session terminated");
        if let Err(e) = self.close() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every link and listener. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), Error> {
        let mut first_err = None;
        for link in &mut self.links {
            if let Some(peer) = link.peer.as_mut() {
                if let Err(e) = peer.close() {
                    first_err.get_or_insert(e);
                }
            }
            if let Some(mut listener) = link.listener.take() {
                if let Err(e) = listener.close() {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for BbdServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
