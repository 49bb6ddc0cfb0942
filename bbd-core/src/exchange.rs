//! Steady-state cycle exchange.
//!
//! Every device travels as its correlation id followed, if the device is in use, by its
//! payload and optional modality pair. A reader may meet an event (absorbed into the
//! signal word, then framing continues) or a terminate code (the call stops there and
//! reports the reason). Messages share the same stream behind their own control code.

use tracing::{debug, info};

use crate::channel::BufferedChannel;
use crate::device::{Device, Payload};
use crate::error::Error;
use crate::peer::Peer;
use crate::protocol::{ControlCode, ExchangeSignal, CTRL_MESSAGE};
use crate::registry::{DeviceHandle, Registry};

/// Outcome of one cycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Completed,
    /// The peer ended the session; remaining devices were not touched.
    Terminated { reason: i32 },
}

impl Exchange {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Exchange::Terminated { .. })
    }
}

/// Read control codes until this device's id turns up. Events are absorbed on the way.
/// Returns the reason if the peer terminated instead.
pub(crate) fn expect_device(
    peer: &mut Peer,
    signal: &mut ExchangeSignal,
    id: u16,
) -> Result<Option<i32>, Error> {
    loop {
        let code = peer.next_code()?;
        match ControlCode::classify(code) {
            ControlCode::Event => signal.absorb(peer.rx.read_u32()?),
            ControlCode::Terminate => {
                let reason = peer.rx.read_i32()?;
                info!(reason, "peer terminated");
                return Ok(Some(reason));
            }
            ControlCode::Device(got) if got == id => return Ok(None),
            _ => {
                return Err(Error::UnexpectedControlCode {
                    expected: Some(id),
                    got: code,
                })
            }
        }
    }
}

fn read_payload(rx: &mut BufferedChannel, dev: &mut Device) -> Result<(), Error> {
    if !dev.in_use() {
        return Ok(());
    }
    match &mut dev.payload {
        Payload::Bytes(bytes) => rx.read_exact(bytes)?,
        Payload::Floats(floats) => {
            for x in floats.iter_mut() {
                *x = rx.read_f32()?;
            }
        }
    }
    if dev.has_modality() {
        let a = rx.read_i16()?;
        let b = rx.read_i16()?;
        dev.modality = Some((a, b));
    }
    Ok(())
}

fn write_payload(tx: &mut BufferedChannel, dev: &Device) -> Result<(), Error> {
    if !dev.in_use() {
        return Ok(());
    }
    match &dev.payload {
        Payload::Bytes(bytes) => {
            tx.write(bytes)?;
        }
        Payload::Floats(floats) => {
            for &x in floats {
                tx.write_f32(x)?;
            }
        }
    }
    if dev.has_modality() {
        let (a, b) = dev.modality.unwrap_or_default();
        tx.write_i16(a)?;
        tx.write_i16(b)?;
    }
    Ok(())
}

/// Read every listed device from `peer`, in order.
pub(crate) fn read_devices(
    registry: &mut Registry,
    handles: &[DeviceHandle],
    peer: &mut Peer,
    signal: &mut ExchangeSignal,
) -> Result<Exchange, Error> {
    for &h in handles {
        let Some(id) = registry.device(h).id() else {
            continue;
        };
        if let Some(reason) = expect_device(peer, signal, id)? {
            return Ok(Exchange::Terminated { reason });
        }
        read_payload(&mut peer.rx, registry.device_mut(h))?;
    }
    Ok(Exchange::Completed)
}

/// Write every listed device to `peer`, in order, then flush. Returns how many went out.
pub(crate) fn write_devices(
    registry: &Registry,
    handles: &[DeviceHandle],
    peer: &mut Peer,
) -> Result<usize, Error> {
    let mut written = 0;
    for &h in handles {
        let dev = registry.device(h);
        let Some(id) = dev.id() else {
            continue;
        };
        peer.tx.write_u16(id)?;
        write_payload(&mut peer.tx, dev)?;
        written += 1;
    }
    if written > 0 {
        peer.tx.flush()?;
    }
    Ok(written)
}

/// Send one message: control code, length, bytes.
pub(crate) fn send_message(peer: &mut Peer, message: &[u8]) -> Result<(), Error> {
    if message.is_empty() {
        return Err(Error::EmptyMessage);
    }
    let len = i32::try_from(message.len()).map_err(|_| Error::BadMessageLength(i32::MAX))?;
    peer.tx.write_u16(CTRL_MESSAGE)?;
    peer.tx.write_i32(len)?;
    peer.tx.write(message)?;
    peer.tx.flush()?;
    debug!(len, "message sent");
    Ok(())
}

/// Reusable receive buffer. Grows to fit the longest message seen, never shrinks.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

/// A received message, borrowed from its [`MessageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    with_nul: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.with_nul[..self.with_nul.len() - 1]
    }

    /// The message followed by its NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &'a [u8] {
        self.with_nul
    }

    /// Length as sent, terminator excluded.
    pub fn len(&self) -> usize {
        self.with_nul.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive the next message. Events ahead of it are absorbed; any other code is a
/// framing error, and a terminate ends the session.
pub(crate) fn recv_message<'a>(
    peer: &mut Peer,
    signal: &mut ExchangeSignal,
    buffer: &'a mut MessageBuffer,
) -> Result<Message<'a>, Error> {
    loop {
        let code = peer.next_code()?;
        match ControlCode::classify(code) {
            ControlCode::Event => signal.absorb(peer.rx.read_u32()?),
            ControlCode::Message => break,
            ControlCode::Terminate => {
                let reason = peer.rx.read_i32()?;
                return Err(Error::PeerAborted { reason });
            }
            _ => {
                return Err(Error::UnexpectedControlCode {
                    expected: Some(CTRL_MESSAGE),
                    got: code,
                })
            }
        }
    }
    let len = peer.rx.read_i32()?;
    if len <= 0 {
        return Err(Error::BadMessageLength(len));
    }
    let len = len as usize;
    if buffer.buf.len() < len + 1 {
        buffer.buf.resize(len + 1, 0);
    }
    peer.rx.read_exact(&mut buffer.buf[..len])?;
    buffer.buf[len] = 0;
    debug!(len, "message received");
    Ok(Message {
        with_nul: &buffer.buf[..len + 1],
    })
}
