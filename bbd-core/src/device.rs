//! Device model: kinds, flag words, per-kind geometry and the payload each device owns.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Longest device name that fits the 16-byte wire field with its terminating NUL.
pub const MAX_NAME_LEN: usize = 15;

/// Width of the name field in a handshake record.
pub const NAME_FIELD_LEN: usize = 16;

/// Largest accepted geometry dimension (fits a signed 16-bit field).
pub const MAX_DIMENSION: u32 = i16::MAX as u32;

/// Device kind. Also the order in which kind lists are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Sense,
    TrialCamera,
    EventCamera,
    SeriesCamera,
    Value,
    Effector,
}

impl DeviceKind {
    /// Every kind in reconciliation order.
    pub const ALL: [DeviceKind; 6] = [
        DeviceKind::Sense,
        DeviceKind::TrialCamera,
        DeviceKind::EventCamera,
        DeviceKind::SeriesCamera,
        DeviceKind::Value,
        DeviceKind::Effector,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn is_camera(self) -> bool {
        matches!(
            self,
            DeviceKind::TrialCamera | DeviceKind::EventCamera | DeviceKind::SeriesCamera
        )
    }

    /// Flag bits every device of this kind carries.
    pub fn base_flags(self) -> DeviceFlags {
        match self {
            DeviceKind::Sense => DeviceFlags::SENSE,
            DeviceKind::TrialCamera => DeviceFlags::CAMERA | DeviceFlags::TRIAL,
            DeviceKind::EventCamera => DeviceFlags::CAMERA | DeviceFlags::EVENT,
            DeviceKind::SeriesCamera => DeviceFlags::CAMERA | DeviceFlags::SERIES,
            DeviceKind::Value => DeviceFlags::VALUE | DeviceFlags::FLOAT,
            DeviceKind::Effector => DeviceFlags::EFFECTOR | DeviceFlags::FLOAT,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceKind::Sense => "sense",
            DeviceKind::TrialCamera => "trial-camera",
            DeviceKind::EventCamera => "event-camera",
            DeviceKind::SeriesCamera => "series-camera",
            DeviceKind::Value => "value",
            DeviceKind::Effector => "effector",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Flag word sent with every handshake record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u16 {
        const SENSE = 0x0001;
        const CAMERA = 0x0002;
        const VALUE = 0x0004;
        const EFFECTOR = 0x0008;
        const TRIAL = 0x0010;
        const EVENT = 0x0020;
        const SERIES = 0x0040;
        /// Payload is an array of 32-bit floats.
        const FLOAT = 0x0080;
        /// Two extra i16 follow the payload every cycle.
        const MODALITY = 0x0100;
        const COLOR16 = 0x0200;
        const COLOR24 = 0x0400;
        const IN_USE = 0x1000;
        const LINKED = 0x2000;
        const OPEN = 0x4000;
        const BIG_ENDIAN = 0x8000;
    }
}

impl DeviceFlags {
    /// Bits left to local variation; never compared across the wire.
    pub const RESERVED: DeviceFlags = DeviceFlags::IN_USE
        .union(DeviceFlags::LINKED)
        .union(DeviceFlags::OPEN)
        .union(DeviceFlags::BIG_ENDIAN);

    /// True when both words agree outside the reserved bits.
    pub fn compatible(self, other: DeviceFlags) -> bool {
        self.difference(Self::RESERVED) == other.difference(Self::RESERVED)
    }
}

/// Element type of a sense array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Element {
    #[default]
    Byte,
    Float,
}

/// Pixel encoding of a camera image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    #[default]
    Gray8,
    Rgb565,
    Rgb24,
}

impl ColorMode {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ColorMode::Gray8 => 1,
            ColorMode::Rgb565 => 2,
            ColorMode::Rgb24 => 3,
        }
    }

    fn flags(self) -> DeviceFlags {
        match self {
            ColorMode::Gray8 => DeviceFlags::empty(),
            ColorMode::Rgb565 => DeviceFlags::COLOR16 | DeviceFlags::BIG_ENDIAN,
            ColorMode::Rgb24 => DeviceFlags::COLOR24,
        }
    }
}

/// Effector output dimensions, possibly left to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectorShape {
    Fixed { rows: u32, cols: u32 },
    /// Adopt whatever the remote record declares during the handshake.
    Deferred,
}

/// Per-kind geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Sense { rows: u32, cols: u32, element: Element },
    Camera { width: u32, height: u32, color: ColorMode },
    Value { count: u32 },
    Effector(EffectorShape),
}

impl Geometry {
    fn dimensions(&self) -> Vec<u32> {
        match *self {
            Geometry::Sense { rows, cols, .. } => vec![rows, cols],
            Geometry::Camera { width, height, .. } => vec![width, height],
            Geometry::Value { count } => vec![count],
            Geometry::Effector(EffectorShape::Fixed { rows, cols }) => vec![rows, cols],
            Geometry::Effector(EffectorShape::Deferred) => Vec::new(),
        }
    }

    fn fits(&self, kind: DeviceKind) -> bool {
        match self {
            Geometry::Sense { .. } => kind == DeviceKind::Sense,
            Geometry::Camera { .. } => kind.is_camera(),
            Geometry::Value { .. } => kind == DeviceKind::Value,
            Geometry::Effector(_) => kind == DeviceKind::Effector,
        }
    }

    /// Number of payload elements (bytes or floats).
    pub fn elements(&self) -> usize {
        match *self {
            Geometry::Sense { rows, cols, .. } => rows as usize * cols as usize,
            Geometry::Camera { width, height, color } => {
                width as usize * height as usize * color.bytes_per_pixel() as usize
            }
            Geometry::Value { count } => count as usize,
            Geometry::Effector(EffectorShape::Fixed { rows, cols }) => rows as usize * cols as usize,
            Geometry::Effector(EffectorShape::Deferred) => 0,
        }
    }

    fn is_float(&self) -> bool {
        match self {
            Geometry::Sense { element, .. } => *element == Element::Float,
            Geometry::Camera { .. } => false,
            Geometry::Value { .. } | Geometry::Effector(_) => true,
        }
    }

    /// Payload length in wire bytes.
    pub fn byte_len(&self) -> usize {
        if self.is_float() {
            self.elements() * 4
        } else {
            self.elements()
        }
    }

    fn flags(&self) -> DeviceFlags {
        let mut flags = DeviceFlags::empty();
        if self.is_float() {
            flags |= DeviceFlags::FLOAT;
        }
        if let Geometry::Camera { color, .. } = self {
            flags |= color.flags();
        }
        flags
    }
}

/// One cycle's data, owned by its device.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
}

impl Payload {
    fn for_geometry(geometry: &Geometry) -> Self {
        if geometry.is_float() {
            Payload::Floats(vec![0.0; geometry.elements()])
        } else {
            Payload::Bytes(vec![0; geometry.elements()])
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Floats(_) => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Floats(_) => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Payload::Floats(f) => Some(f),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_floats_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Payload::Floats(f) => Some(f),
            Payload::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Floats(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote endpoint a server-side device talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSpec {
    /// Absent or empty means the local host.
    pub host: Option<String>,
    /// Absent means the default data port.
    pub port: Option<u16>,
}

/// Registry-time configuration problem. Codes fall in 100..200.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device name {name:?} longer than {MAX_NAME_LEN} bytes")]
    NameTooLong { name: String },
    #[error("empty device name")]
    EmptyName,
    #[error("device name {name:?} contains a NUL byte")]
    BadName { name: String },
    #[error("{kind} {name}: bad geometry {geometry:?}")]
    BadGeometry {
        kind: DeviceKind,
        name: String,
        geometry: Geometry,
    },
    #[error("{kind} {name}: name already registered")]
    DuplicateName { kind: DeviceKind, name: String },
    #[error("{name}: client devices cannot name a remote host")]
    HostNotAllowed { name: String },
    #[error("{name}: deferred effector length cannot be announced by the sending side")]
    DeferredLength { name: String },
}

impl RegistryError {
    pub fn code(&self) -> i32 {
        match self {
            RegistryError::NameTooLong { .. } => 101,
            RegistryError::EmptyName => 102,
            RegistryError::BadName { .. } => 103,
            RegistryError::BadGeometry { .. } => 110,
            RegistryError::DuplicateName { .. } => 120,
            RegistryError::HostNotAllowed { .. } => 130,
            RegistryError::DeferredLength { .. } => 131,
        }
    }
}

/// Check a device name fits the wire field.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RegistryError::NameTooLong {
            name: name.to_string(),
        });
    }
    if name.bytes().any(|b| b == 0) {
        return Err(RegistryError::BadName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Name as the NUL-padded wire field.
pub fn encode_name(name: &str) -> [u8; NAME_FIELD_LEN] {
    let mut field = [0u8; NAME_FIELD_LEN];
    let n = name.len().min(MAX_NAME_LEN);
    field[..n].copy_from_slice(&name.as_bytes()[..n]);
    field
}

/// Name from the wire field: everything before the first NUL.
pub fn decode_name(field: &[u8; NAME_FIELD_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Description of a device to register.
#[derive(Debug, Clone)]
pub struct Registration {
    pub kind: DeviceKind,
    pub name: String,
    pub geometry: Geometry,
    pub modality: bool,
    pub in_use: bool,
    pub host: Option<HostSpec>,
}

impl Registration {
    fn new(kind: DeviceKind, name: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            kind,
            name: name.into(),
            geometry,
            modality: false,
            in_use: true,
            host: None,
        }
    }

    pub fn sense(name: impl Into<String>, rows: u32, cols: u32, element: Element) -> Self {
        Self::new(DeviceKind::Sense, name, Geometry::Sense { rows, cols, element })
    }

    /// `kind` must be one of the camera kinds.
    pub fn camera(kind: DeviceKind, name: impl Into<String>, width: u32, height: u32, color: ColorMode) -> Self {
        Self::new(kind, name, Geometry::Camera { width, height, color })
    }

    pub fn value(name: impl Into<String>, count: u32) -> Self {
        Self::new(DeviceKind::Value, name, Geometry::Value { count })
    }

    pub fn effector(name: impl Into<String>, rows: u32, cols: u32) -> Self {
        Self::new(
            DeviceKind::Effector,
            name,
            Geometry::Effector(EffectorShape::Fixed { rows, cols }),
        )
    }

    /// Effector whose dimensions come from the remote record.
    pub fn deferred_effector(name: impl Into<String>) -> Self {
        Self::new(DeviceKind::Effector, name, Geometry::Effector(EffectorShape::Deferred))
    }

    /// Exchange a modality id pair after the payload every cycle.
    pub fn with_modality(mut self) -> Self {
        self.modality = true;
        self
    }

    /// Register without payload traffic; the id is still exchanged each cycle.
    pub fn unused(mut self) -> Self {
        self.in_use = false;
        self
    }

    pub fn on_host(mut self, host: HostSpec) -> Self {
        self.host = Some(host);
        self
    }

    /// Validate name and geometry and compute the flag word.
    pub(crate) fn check(&self) -> Result<DeviceFlags, RegistryError> {
        validate_name(&self.name)?;
        let dims = self.geometry.dimensions();
        let in_range = dims.iter().all(|&d| d > 0 && d <= MAX_DIMENSION);
        if !self.geometry.fits(self.kind) || !in_range {
            return Err(RegistryError::BadGeometry {
                kind: self.kind,
                name: self.name.clone(),
                geometry: self.geometry,
            });
        }
        if self.geometry.byte_len() > i32::MAX as usize {
            return Err(RegistryError::BadGeometry {
                kind: self.kind,
                name: self.name.clone(),
                geometry: self.geometry,
            });
        }
        let mut flags = self.kind.base_flags() | self.geometry.flags();
        if self.modality {
            flags |= DeviceFlags::MODALITY;
        }
        if self.in_use {
            flags |= DeviceFlags::IN_USE;
        }
        Ok(flags)
    }
}

/// One registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub(crate) kind: DeviceKind,
    pub(crate) name: String,
    pub(crate) geometry: Geometry,
    pub(crate) flags: DeviceFlags,
    pub(crate) byte_len: usize,
    pub(crate) id: Option<u16>,
    pub(crate) host: Option<usize>,
    pub payload: Payload,
    /// Modality id pair, exchanged when the device carries the modality flag.
    pub modality: Option<(i16, i16)>,
}

impl Device {
    pub(crate) fn from_registration(reg: &Registration, flags: DeviceFlags, host: Option<usize>) -> Self {
        Self {
            kind: reg.kind,
            name: reg.name.clone(),
            geometry: reg.geometry,
            flags,
            byte_len: reg.geometry.byte_len(),
            id: None,
            host,
            payload: Payload::for_geometry(&reg.geometry),
            modality: reg.modality.then_some((0, 0)),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Wire length of one cycle's payload.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Correlation id, set by the handshake.
    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn in_use(&self) -> bool {
        self.flags.contains(DeviceFlags::IN_USE)
    }

    pub fn has_modality(&self) -> bool {
        self.flags.contains(DeviceFlags::MODALITY)
    }

    pub(crate) fn is_deferred(&self) -> bool {
        matches!(self.geometry, Geometry::Effector(EffectorShape::Deferred))
    }

    /// Effector output dimensions, zero while deferred.
    pub(crate) fn effector_dims(&self) -> (u32, u32) {
        match self.geometry {
            Geometry::Effector(EffectorShape::Fixed { rows, cols }) => (rows, cols),
            _ => (0, 0),
        }
    }

    /// Fill a deferred effector from the remote record.
    pub(crate) fn adopt_effector_shape(&mut self, rows: u32, cols: u32, byte_len: usize) {
        self.geometry = Geometry::Effector(EffectorShape::Fixed { rows, cols });
        self.byte_len = byte_len;
        self.payload = Payload::Floats(vec![0.0; byte_len / 4]);
    }

    pub(crate) fn set_in_use(&mut self, in_use: bool) {
        self.flags.set(DeviceFlags::IN_USE, in_use);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_bounded() {
        assert!(validate_name("S1").is_ok());
        assert!(validate_name("exactly15chars!").is_ok());
        assert!(matches!(
            validate_name("sixteen-chars-xx"),
            Err(RegistryError::NameTooLong { .. })
        ));
        assert!(matches!(validate_name(""), Err(RegistryError::EmptyName)));
        assert!(matches!(validate_name("a\0b"), Err(RegistryError::BadName { .. })));
    }

    #[test]
    fn name_field_is_nul_padded() {
        let field = encode_name("E1");
        assert_eq!(&field[..3], b"E1\0");
        assert!(field[2..].iter().all(|&b| b == 0));
        assert_eq!(decode_name(&field), "E1");
        let full = encode_name("exactly15chars!");
        assert_eq!(full[15], 0);
        assert_eq!(decode_name(&full), "exactly15chars!");
    }

    #[test]
    fn byte_lengths_follow_geometry() {
        assert_eq!(Registration::sense("S", 4, 4, Element::Byte).geometry.byte_len(), 16);
        assert_eq!(Registration::sense("S", 2, 3, Element::Float).geometry.byte_len(), 24);
        assert_eq!(
            Registration::camera(DeviceKind::TrialCamera, "C", 8, 6, ColorMode::Rgb565)
                .geometry
                .byte_len(),
            96
        );
        assert_eq!(Registration::value("V", 5).geometry.byte_len(), 20);
        assert_eq!(Registration::effector("E", 1, 3).geometry.byte_len(), 12);
        assert_eq!(Registration::deferred_effector("D").geometry.byte_len(), 0);
    }

    #[test]
    fn flags_from_registration() {
        let flags = Registration::camera(DeviceKind::EventCamera, "C", 2, 2, ColorMode::Rgb565)
            .with_modality()
            .check()
            .unwrap();
        assert!(flags.contains(DeviceFlags::CAMERA | DeviceFlags::EVENT | DeviceFlags::COLOR16));
        assert!(flags.contains(DeviceFlags::BIG_ENDIAN | DeviceFlags::MODALITY | DeviceFlags::IN_USE));
        assert!(!flags.contains(DeviceFlags::FLOAT));

        let unused = Registration::value("V", 1).unused().check().unwrap();
        assert!(!unused.contains(DeviceFlags::IN_USE));
        assert!(unused.contains(DeviceFlags::FLOAT));
    }

    #[test]
    fn reserved_bits_ignored_when_comparing() {
        let a = DeviceFlags::SENSE | DeviceFlags::IN_USE;
        let b = DeviceFlags::SENSE | DeviceFlags::BIG_ENDIAN | DeviceFlags::LINKED;
        assert!(a.compatible(b));
        assert!(!a.compatible(DeviceFlags::SENSE | DeviceFlags::FLOAT));
    }

    #[test]
    fn geometry_bounds_checked() {
        assert!(matches!(
            Registration::sense("S", 0, 4, Element::Byte).check(),
            Err(RegistryError::BadGeometry { .. })
        ));
        assert!(matches!(
            Registration::value("V", MAX_DIMENSION + 1).check(),
            Err(RegistryError::BadGeometry { .. })
        ));
        assert!(Registration::value("V", MAX_DIMENSION).check().is_ok());
        assert!(matches!(
            Registration::camera(DeviceKind::Value, "C", 1, 1, ColorMode::Gray8).check(),
            Err(RegistryError::BadGeometry { .. })
        ));
        assert!(Registration::deferred_effector("D").check().is_ok());
    }

    #[test]
    fn kinds_parse_from_kebab_case() {
        #[derive(Deserialize)]
        struct Probe {
            kind: DeviceKind,
            color: ColorMode,
        }
        let p: Probe = toml::from_str("kind = \"series-camera\"\ncolor = \"rgb565\"").unwrap();
        assert_eq!(p.kind, DeviceKind::SeriesCamera);
        assert_eq!(p.color, ColorMode::Rgb565);
    }
}
