//! Wire constants: control codes, ports, protocol version, correlation ids and the
//! exchange signal word.

use bitflags::bitflags;

use crate::error::Error;

/// Current protocol version, sent by the client right after the all-clear code.
pub const PROTOCOL_VERSION: i32 = 1;

/// Well-known launcher port. The data port sits right above it.
pub const BBD_INIT_PORT: u16 = 9600;

/// Default port for the data exchange channel.
pub const DEFAULT_DATA_PORT: u16 = BBD_INIT_PORT + 1;

/// Opens a session: the client is ready to reconcile devices.
pub const CTRL_ALL_CLEAR: u16 = 0x0000;
/// Followed by an i32 reason.
pub const CTRL_TERMINATE: u16 = 0x1000;
/// Followed by a u32 event code, then another control code.
pub const CTRL_EVENT: u16 = 0x2000;
/// Followed by an i32 length and that many raw bytes.
pub const CTRL_MESSAGE: u16 = 0x4000;

/// Highest valid correlation id. Every reserved code lies above it.
pub const MAX_ID: u16 = 0x0FFF;

/// Step between consecutive correlation ids.
pub const ID_STRIDE: u16 = 13;

/// Length field that ends one kind's list in the handshake.
pub const END_OF_LIST: i32 = 0;

/// A 16-bit control code read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Device(u16),
    Terminate,
    Event,
    Message,
    Unknown(u16),
}

impl ControlCode {
    pub fn classify(code: u16) -> Self {
        match code {
            CTRL_TERMINATE => ControlCode::Terminate,
            CTRL_EVENT => ControlCode::Event,
            CTRL_MESSAGE => ControlCode::Message,
            id if id <= MAX_ID => ControlCode::Device(id),
            other => ControlCode::Unknown(other),
        }
    }
}

bitflags! {
    /// Out-of-band events accumulated between deliveries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExchangeSignal: u32 {
        const RESET = 0x0001;
        const IMAGE_READY = 0x0002;
        const TERMINATE = 0x0004;
    }
}

impl ExchangeSignal {
    /// Merge a raw event code, keeping bits with no name.
    pub fn absorb(&mut self, code: u32) {
        *self |= ExchangeSignal::from_bits_retain(code);
    }

    /// Return the accumulated word and clear it.
    pub fn take(&mut self) -> ExchangeSignal {
        std::mem::take(self)
    }
}

/// Hands out correlation ids for one remote host: `ID_STRIDE`, `2 * ID_STRIDE`, ...
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: ID_STRIDE as u32,
        }
    }

    pub fn next_id(&mut self) -> Result<u16, Error> {
        if self.next > MAX_ID as u32 {
            return Err(Error::IdSpaceExhausted);
        }
        let id = self.next as u16;
        self.next += ID_STRIDE as u32;
        Ok(id)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_lie_above_id_space() {
        for code in [CTRL_TERMINATE, CTRL_EVENT, CTRL_MESSAGE] {
            assert!(code > MAX_ID);
        }
        assert_eq!(ControlCode::classify(13), ControlCode::Device(13));
        assert_eq!(ControlCode::classify(0x1000), ControlCode::Terminate);
        assert_eq!(ControlCode::classify(0x2000), ControlCode::Event);
        assert_eq!(ControlCode::classify(0x4000), ControlCode::Message);
        assert_eq!(ControlCode::classify(0x3000), ControlCode::Unknown(0x3000));
    }

    #[test]
    fn ids_step_by_stride_and_never_wrap() {
        let mut ids = IdAllocator::new();
        let mut last = 0u16;
        let mut count = 0;
        loop {
            match ids.next_id() {
                Ok(id) => {
                    assert_eq!(id, last + ID_STRIDE);
                    assert!(id <= MAX_ID);
                    last = id;
                    count += 1;
                }
                Err(e) => {
                    assert!(matches!(e, Error::IdSpaceExhausted));
                    break;
                }
            }
        }
        assert_eq!(count, MAX_ID as usize / ID_STRIDE as usize);
        assert!(ids.next_id().is_err());
    }

    #[test]
    fn signal_accumulates_and_clears() {
        let mut signal = ExchangeSignal::default();
        signal.absorb(ExchangeSignal::IMAGE_READY.bits());
        signal.absorb(0x100);
        let got = signal.take();
        assert!(got.contains(ExchangeSignal::IMAGE_READY));
        assert_eq!(got.bits(), 0x102);
        assert!(signal.is_empty());
    }

    #[test]
    fn data_port_is_above_init_port() {
        assert_eq!(DEFAULT_DATA_PORT, BBD_INIT_PORT + 1);
    }
}
