//! Session open and device reconciliation.
//!
//! The client opens the session with the all-clear code and the protocol version, or with
//! a terminate code and a reason if it cannot go on. The server then sends every kind list
//! for that host, one record per device, each list closed by a zero length. The client
//! matches records by name, adopts the ids and answers each list with a signed count:
//! the number matched, or minus the number of mismatches.

use tracing::{debug, info, warn};

use crate::device::{decode_name, encode_name, DeviceFlags, DeviceKind, NAME_FIELD_LEN};
use crate::error::Error;
use crate::peer::Peer;
use crate::protocol::{
    ControlCode, IdAllocator, CTRL_ALL_CLEAR, END_OF_LIST, MAX_ID, PROTOCOL_VERSION,
};
use crate::registry::{DeviceHandle, HostId, Registry};

/// Where one host's handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    AwaitingPeerMetadata,
    Reconciling(DeviceKind),
    Established,
    Failed,
}

/// Client-side result of reconciling one kind list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindReport {
    pub kind: DeviceKind,
    pub received: usize,
    pub matched: usize,
    pub mismatches: usize,
}

impl KindReport {
    /// The count sent back to the server.
    pub fn reply(&self) -> i32 {
        if self.mismatches > 0 {
            -(self.mismatches as i32)
        } else {
            self.matched as i32
        }
    }
}

/// Client-side result of the whole handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    pub state: HandshakeState,
    pub kinds: Vec<KindReport>,
}

impl HandshakeReport {
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn kind(&self, kind: DeviceKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn mismatches(&self) -> usize {
        self.kinds.iter().map(|k| k.mismatches).sum()
    }
}

/// Client: announce readiness and our protocol version.
pub(crate) fn open_session(peer: &mut Peer) -> Result<(), Error> {
    peer.write_control(CTRL_ALL_CLEAR, PROTOCOL_VERSION)?;
    peer.tx.flush()?;
    Ok(())
}

/// Client: tell the server we cannot go on.
pub(crate) fn refuse_session(peer: &mut Peer, reason: i32) -> Result<(), Error> {
    peer.send_terminate(reason)?;
    Ok(())
}

/// Server: wait for the client's opening code.
pub(crate) fn accept_session(peer: &mut Peer) -> Result<(), Error> {
    let code = peer.rx.read_u16()?;
    if code == CTRL_ALL_CLEAR {
        let version = peer.rx.read_i32()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        return Ok(());
    }
    match ControlCode::classify(code) {
        ControlCode::Terminate => {
            let reason = peer.rx.read_i32()?;
            Err(Error::PeerAborted { reason })
        }
        _ => Err(Error::UnexpectedControlCode {
            expected: Some(CTRL_ALL_CLEAR),
            got: code,
        }),
    }
}

/// Server: send one kind list for `host`, assigning ids, and check the client's count.
pub(crate) fn send_kind(
    registry: &mut Registry,
    host: HostId,
    kind: DeviceKind,
    peer: &mut Peer,
    ids: &mut IdAllocator,
) -> Result<usize, Error> {
    let handles = registry.host_handles(kind, host);
    for &h in &handles {
        let id = ids.next_id()?;
        let dev = registry.device_mut(h);
        dev.id = Some(id);
        let (rows, cols) = dev.effector_dims();
        let tx = &mut peer.tx;
        tx.write_i32(dev.byte_len as i32)?;
        tx.write(&encode_name(&dev.name))?;
        tx.write_u16(dev.flags.bits())?;
        if kind == DeviceKind::Effector {
            tx.write_i32(rows as i32)?;
            tx.write_i32(cols as i32)?;
        }
        tx.write_u16(id)?;
    }
    peer.tx.write_i32(END_OF_LIST)?;
    peer.tx.flush()?;

    let sent = handles.len() as i32;
    let reported = peer.rx.read_i32()?;
    if reported != sent {
        warn!(%kind, sent, reported, "handshake count mismatch");
        return Err(Error::HandshakeMismatch {
            kind,
            sent,
            reported,
        });
    }
    debug!(%kind, sent, "kind reconciled");
    Ok(handles.len())
}

/// One record as it arrives.
struct Record {
    len: i32,
    name: String,
    flags: DeviceFlags,
    dims: (i32, i32),
    id: u16,
}

fn read_record(peer: &mut Peer, kind: DeviceKind, len: i32) -> Result<Record, Error> {
    let mut field = [0u8; NAME_FIELD_LEN];
    peer.rx.read_exact(&mut field)?;
    let flags = DeviceFlags::from_bits_retain(peer.rx.read_u16()?);
    let dims = if kind == DeviceKind::Effector {
        (peer.rx.read_i32()?, peer.rx.read_i32()?)
    } else {
        (0, 0)
    };
    let id = peer.rx.read_u16()?;
    if id > MAX_ID {
        return Err(Error::UnexpectedControlCode { expected: None, got: id });
    }
    Ok(Record {
        len,
        name: decode_name(&field),
        flags,
        dims,
        id,
    })
}

/// Client: receive one kind list, match it against ours and answer with the count.
///
/// The list is reordered to matched devices in arrival order, then rejected ones, then
/// local devices the server never sent. Only records the server sent can count as
/// mismatches; a local device it never offered is left idle.
pub(crate) fn receive_kind(
    registry: &mut Registry,
    kind: DeviceKind,
    peer: &mut Peer,
) -> Result<KindReport, Error> {
    registry.clear_ids(kind);
    let mut unmatched: Vec<DeviceHandle> = registry.handles(kind).to_vec();
    let mut matched = Vec::new();
    let mut rejected = Vec::new();
    let mut received = 0;
    let mut mismatches = 0;

    loop {
        let len = peer.rx.read_i32()?;
        if len == END_OF_LIST {
            break;
        }
        if len < 0 {
            return Err(Error::BadRecord { kind, len });
        }
        let rec = read_record(peer, kind, len)?;
        received += 1;

        let Some(pos) = unmatched
            .iter()
            .position(|&h| registry.device(h).name == rec.name)
        else {
            warn!(%kind, name = %rec.name, "peer sent unknown device");
            mismatches += 1;
            continue;
        };
        let h = unmatched.remove(pos);
        let dev = registry.device_mut(h);

        let flags_ok = dev.flags.compatible(rec.flags);
        let len_ok = if dev.is_deferred() {
            if flags_ok {
                let rows = rec.dims.0.max(0) as u32;
                let cols = rec.dims.1.max(0) as u32;
                dev.adopt_effector_shape(rows, cols, rec.len as usize);
            }
            true
        } else {
            dev.byte_len == rec.len as usize
        };
        if flags_ok && len_ok {
            dev.id = Some(rec.id);
            dev.set_in_use(rec.flags.contains(DeviceFlags::IN_USE));
            matched.push(h);
        } else {
            warn!(
                %kind,
                name = %rec.name,
                local_len = dev.byte_len,
                remote_len = rec.len,
                local_flags = dev.flags.bits(),
                remote_flags = rec.flags.bits(),
                "device does not match peer record"
            );
            mismatches += 1;
            rejected.push(h);
        }
    }

    // Not offered: stays without an id and out of the exchange.
    for &h in &unmatched {
        let dev = registry.device_mut(h);
        dev.set_in_use(false);
        warn!(%kind, name = dev.name(), "device not offered by peer");
    }

    let report = KindReport {
        kind,
        received,
        matched: matched.len(),
        mismatches,
    };
    peer.tx.write_i32(report.reply())?;
    peer.tx.flush()?;

    let mut order = matched;
    order.extend(rejected);
    order.extend(unmatched);
    registry.reorder(kind, order);
    debug!(%kind, received, matched = report.matched, mismatches, "kind received");
    Ok(report)
}

/// Server side of a whole handshake with one host. `state` tracks progress; on failure the
/// host's channels are closed so the client sees end of file.
pub(crate) fn serve(
    registry: &mut Registry,
    host: HostId,
    peer: &mut Peer,
    state: &mut HandshakeState,
) -> Result<(), Error> {
    match reconcile_host(registry, host, peer, state) {
        Ok(total) => {
            *state = HandshakeState::Established;
            let remote = registry.host(host);
            info!(host = %remote.host, port = remote.port, devices = total, "handshake established");
            Ok(())
        }
        Err(e) => {
            *state = HandshakeState::Failed;
            let _ = peer.close();
            Err(e)
        }
    }
}

fn reconcile_host(
    registry: &mut Registry,
    host: HostId,
    peer: &mut Peer,
    state: &mut HandshakeState,
) -> Result<usize, Error> {
    *state = HandshakeState::AwaitingPeerMetadata;
    accept_session(peer)?;
    let mut ids = IdAllocator::new();
    let mut total = 0;
    for kind in DeviceKind::ALL {
        *state = HandshakeState::Reconciling(kind);
        total += send_kind(registry, host, kind, peer, &mut ids)?;
    }
    Ok(total)
}

/// Client side of a whole handshake. Mismatches are reported, not raised.
pub(crate) fn join(registry: &mut Registry, peer: &mut Peer) -> Result<HandshakeReport, Error> {
    open_session(peer)?;
    let mut kinds = Vec::with_capacity(DeviceKind::ALL.len());
    for kind in DeviceKind::ALL {
        kinds.push(receive_kind(registry, kind, peer)?);
    }
    let state = if kinds.iter().all(|k| k.mismatches == 0) {
        HandshakeState::Established
    } else {
        HandshakeState::Failed
    };
    info!(?state, devices = kinds.iter().map(|k| k.matched).sum::<usize>(), "handshake finished");
    Ok(HandshakeReport { state, kinds })
}
