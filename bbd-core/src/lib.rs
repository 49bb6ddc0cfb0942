//! BBD bridge core: robot (client) and neural simulator (server) exchange sensor, camera,
//! value and effector data every simulation cycle over a buffered big-endian byte stream.
//! Blocking, single-threaded per session; the caller owns scheduling.

pub mod channel;
pub mod codec;
pub mod device;
pub mod error;
pub mod exchange;
pub mod handshake;
pub mod peer;
pub mod protocol;
pub mod registry;

mod client;
mod scalar;
mod server;

pub use channel::{
    channels_share_identity, AccessMethod, BufferedChannel, ChannelError, ChannelSpec, Direction, Format,
    Line, OpenFailure, OpenOverrides, ReadStatus, Whence,
};
pub use client::BbdClient;
pub use device::{
    ColorMode, Device, DeviceFlags, DeviceKind, EffectorShape, Element, Geometry, HostSpec, Payload,
    Registration, RegistryError,
};
pub use error::{Coded, Error, ErrorPolicy};
pub use exchange::{Exchange, Message};
pub use handshake::{HandshakeReport, HandshakeState, KindReport};
pub use protocol::{ExchangeSignal, BBD_INIT_PORT, DEFAULT_DATA_PORT, PROTOCOL_VERSION};
pub use registry::{DeviceHandle, HostId, Registry, RemoteHost, Side};
pub use server::BbdServer;
