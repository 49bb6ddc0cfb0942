//! One connected peer: a read channel and a write channel over the same socket, plus the
//! one-slot look-ahead for control codes read while polling.

use bitflags::bitflags;
use tracing::debug;

use crate::channel::{AccessMethod, BufferedChannel, ChannelError, ChannelSpec, Direction};
use crate::codec::Scalar;
use crate::protocol::{ControlCode, ExchangeSignal, CTRL_EVENT, CTRL_TERMINATE};

bitflags! {
    /// Per-host session state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostFlags: u8 {
        /// Effector data has been written to this host.
        const EFFECTOR_TRAFFIC = 0x01;
        const CLOSED = 0x02;
    }
}

#[derive(Debug)]
pub struct Peer {
    pub(crate) rx: BufferedChannel,
    pub(crate) tx: BufferedChannel,
    lookahead: Option<u16>,
    pub(crate) flags: HostFlags,
}

impl Peer {
    /// Connect to `host:port`; an empty host means loopback.
    pub fn connect(host: &str, port: u16, buffer_size: usize) -> Result<Self, ChannelError> {
        let spec = ChannelSpec::new(format!("{host}:{port}"), Direction::Read, AccessMethod::Connect)
            .with_buffer_size(buffer_size);
        let rx = BufferedChannel::open_new(spec)?;
        Self::from_stream(rx, buffer_size)
    }

    /// Wrap an open socket channel, duplicating it for the write side.
    pub fn from_stream(rx: BufferedChannel, buffer_size: usize) -> Result<Self, ChannelError> {
        let tx = rx.duplicate(Some(buffer_size))?;
        debug!(name = rx.name(), peer = ?rx.peer_addr(), "peer connected");
        Ok(Self {
            rx,
            tx,
            lookahead: None,
            flags: HostFlags::empty(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(HostFlags::CLOSED)
    }

    pub fn has_lookahead(&self) -> bool {
        self.lookahead.is_some()
    }

    /// Next control code: the look-ahead slot if full, otherwise a fresh read.
    pub fn next_code(&mut self) -> Result<u16, ChannelError> {
        match self.lookahead.take() {
            Some(code) => Ok(code),
            None => self.rx.read_u16(),
        }
    }

    /// Write a control code and its i32 argument.
    pub(crate) fn write_control(&mut self, code: u16, arg: i32) -> Result<(), ChannelError> {
        self.tx.write_u16(code)?;
        self.tx.write_i32(arg)
    }

    pub(crate) fn send_event(&mut self, code: u32) -> Result<(), ChannelError> {
        self.tx.write_u16(CTRL_EVENT)?;
        self.tx.write_u32(code)?;
        self.tx.flush()?;
        Ok(())
    }

    pub(crate) fn send_terminate(&mut self, reason: i32) -> Result<(), ChannelError> {
        self.write_control(CTRL_TERMINATE, reason)?;
        self.tx.flush()?;
        Ok(())
    }

    /// Drain queued events into `signal`. The first code that is not an event is kept in
    /// the look-ahead slot for the next cycle call. Does nothing while the slot is full. A
    /// non-blocking poll leaves a partly arrived code or event word for the next read.
    pub(crate) fn poll_events(
        &mut self,
        signal: &mut ExchangeSignal,
        blocking: bool,
    ) -> Result<(), ChannelError> {
        if self.lookahead.is_some() || self.is_closed() {
            return Ok(());
        }
        let mut wait = blocking;
        loop {
            if !self.rx.poll_readable(wait)? {
                return Ok(());
            }
            if self.rx.at_eof() {
                return Ok(());
            }
            let code = if wait {
                self.rx.read_u16()?
            } else {
                // Without waiting, take only what is already buffered in full.
                let Some(code) = self.rx.buffered(u16::WIDTH).map(u16::get) else {
                    return Ok(());
                };
                let whole = u16::WIDTH + u32::WIDTH;
                if matches!(ControlCode::classify(code), ControlCode::Event) && self.rx.buffered(whole).is_none() {
                    return Ok(());
                }
                self.rx.consume(u16::WIDTH);
                code
            };
            match ControlCode::classify(code) {
                ControlCode::Event => {
                    signal.absorb(self.rx.read_u32()?);
                    wait = false;
                }
                _ => {
                    self.lookahead = Some(code);
                    return Ok(());
                }
            }
        }
    }

    /// Flush and release both channels. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Ok(());
        }
        self.flags.insert(HostFlags::CLOSED);
        let tx = self.tx.close();
        let rx = self.rx.close();
        debug!(name = self.rx.name(), "peer closed");
        tx.and(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CTRL_MESSAGE;

    fn listener() -> (BufferedChannel, u16) {
        let ch = BufferedChannel::allocate(ChannelSpec::new("127.0.0.1:0", Direction::Read, AccessMethod::Listen)).unwrap();
        let port = ch.local_port().unwrap();
        (ch, port)
    }

    #[test]
    fn poll_keeps_non_event_code_for_next_read() {
        let (mut listen, port) = listener();
        let client = std::thread::spawn(move || {
            let mut peer = Peer::connect("127.0.0.1", port, 64).unwrap();
            peer.tx.write_u16(CTRL_EVENT).unwrap();
            peer.tx.write_u32(0x2).unwrap();
            peer.tx.write_u16(CTRL_EVENT).unwrap();
            peer.tx.write_u32(0x100).unwrap();
            peer.tx.write_u16(26).unwrap();
            peer.tx.flush().unwrap();
            // Wait for the other side to finish before closing.
            let mut done = [0u8; 1];
            peer.rx.read(&mut done).unwrap();
            peer.close().unwrap();
        });
        listen.open().unwrap();
        let mut peer = Peer::from_stream(listen, 64).unwrap();
        let mut signal = ExchangeSignal::default();
        peer.poll_events(&mut signal, true).unwrap();
        assert_eq!(signal.bits(), 0x102);
        assert!(peer.has_lookahead());

        // A full slot is not overwritten.
        peer.poll_events(&mut signal, false).unwrap();
        assert_eq!(peer.next_code().unwrap(), 26);
        assert!(!peer.has_lookahead());

        peer.tx.write(&[1]).unwrap();
        peer.tx.flush().unwrap();
        client.join().unwrap();
        peer.close().unwrap();
        peer.close().unwrap();
        assert!(peer.is_closed());
    }

    #[test]
    fn nonblocking_poll_without_traffic_is_quiet() {
        let (mut listen, port) = listener();
        let client = std::thread::spawn(move || {
            let mut peer = Peer::connect("", port, 0).unwrap();
            let mut go = [0u8; 1];
            peer.rx.read(&mut go).unwrap();
            peer.tx.write_u16(CTRL_MESSAGE).unwrap();
            peer.tx.flush().unwrap();
        });
        listen.open().unwrap();
        let mut peer = Peer::from_stream(listen, 0).unwrap();
        let mut signal = ExchangeSignal::default();
        peer.poll_events(&mut signal, false).unwrap();
        assert!(!peer.has_lookahead());
        assert!(signal.is_empty());

        peer.tx.write(&[0]).unwrap();
        peer.tx.flush().unwrap();
        peer.poll_events(&mut signal, true).unwrap();
        assert_eq!(peer.next_code().unwrap(), CTRL_MESSAGE);
        client.join().unwrap();
    }

    #[test]
    fn nonblocking_poll_leaves_partial_event() {
        let (mut listen, port) = listener();
        let client = std::thread::spawn(move || {
            let mut peer = Peer::connect("127.0.0.1", port, 0).unwrap();
            // Event code plus half of its word.
            peer.tx.write(&[0x20, 0x00, 0x00, 0x00]).unwrap();
            peer.tx.flush().unwrap();
            let mut go = [0u8; 1];
            peer.rx.read(&mut go).unwrap();
            peer.tx.write(&[0x00, 0x04]).unwrap();
            peer.tx.write_u16(26).unwrap();
            peer.tx.flush().unwrap();
        });
        listen.open().unwrap();
        let mut peer = Peer::from_stream(listen, 0).unwrap();
        let mut signal = ExchangeSignal::default();
        while peer.rx.buffered(1).is_none() {
            peer.poll_events(&mut signal, false).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        peer.poll_events(&mut signal, false).unwrap();
        assert!(signal.is_empty());
        assert!(!peer.has_lookahead());
        assert_eq!(peer.rx.tell(), 0);

        peer.tx.write(&[0]).unwrap();
        peer.tx.flush().unwrap();
        peer.poll_events(&mut signal, true).unwrap();
        assert_eq!(signal.bits(), 0x4);
        assert_eq!(peer.next_code().unwrap(), 26);
        client.join().unwrap();
    }
}
