//! Device registry: an arena of devices with one insertion-ordered list per kind, plus
//! the remote hosts server-side devices talk to.

use tracing::debug;

use crate::device::{Device, DeviceKind, HostSpec, Payload, Registration, RegistryError};
use crate::protocol::DEFAULT_DATA_PORT;

/// Which end of the bridge a registry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Robot: produces sense, camera and value data; consumes effector data.
    Client,
    /// Simulator: the reverse. Talks to one or more remote hosts.
    Server,
}

/// Stable handle to a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

/// Index of a remote host record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub(crate) usize);

impl HostId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One peer endpoint. An empty host string means the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
}

impl RemoteHost {
    /// Listening address for this host: every interface, on the record's port.
    pub fn listen_name(&self) -> String {
        format!(":{}", self.port)
    }
}

#[derive(Debug)]
pub struct Registry {
    side: Side,
    default_port: u16,
    devices: Vec<Device>,
    lists: [Vec<DeviceHandle>; 6],
    hosts: Vec<RemoteHost>,
}

impl Registry {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            default_port: DEFAULT_DATA_PORT,
            devices: Vec::new(),
            lists: Default::default(),
            hosts: Vec::new(),
        }
    }

    pub fn client() -> Self {
        Self::new(Side::Client)
    }

    pub fn server() -> Self {
        Self::new(Side::Server)
    }

    /// Port used for devices that name no port. Applies to later registrations only.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Validate and append a device to the tail of its kind's list.
    pub fn register(&mut self, reg: Registration) -> Result<DeviceHandle, RegistryError> {
        let flags = reg.check()?;
        if self.find_by_name(reg.kind, &reg.name).is_some() {
            return Err(RegistryError::DuplicateName {
                kind: reg.kind,
                name: reg.name,
            });
        }
        let host = match self.side {
            Side::Client => {
                if reg.host.is_some() {
                    return Err(RegistryError::HostNotAllowed { name: reg.name });
                }
                None
            }
            Side::Server => {
                // A zero length would read as the end-of-list sentinel.
                if reg.kind == DeviceKind::Effector && reg.geometry.byte_len() == 0 {
                    return Err(RegistryError::DeferredLength { name: reg.name });
                }
                Some(self.resolve_host(reg.host.clone().unwrap_or_default()))
            }
        };

        let handle = DeviceHandle(self.devices.len());
        self.devices.push(Device::from_registration(&reg, flags, host));
        self.lists[reg.kind.index()].push(handle);
        debug!(kind = %reg.kind, name = %reg.name, len = reg.geometry.byte_len(), "device registered");
        Ok(handle)
    }

    /// Find or create the record for `spec`. Dedup is by exact host string and port.
    fn resolve_host(&mut self, spec: HostSpec) -> usize {
        let host = spec.host.unwrap_or_default();
        let port = spec.port.unwrap_or(self.default_port);
        if let Some(i) = self.hosts.iter().position(|h| h.host == host && h.port == port) {
            return i;
        }
        self.hosts.push(RemoteHost { host, port });
        self.hosts.len() - 1
    }

    /// Linear search of one kind's list.
    pub fn find_by_name(&self, kind: DeviceKind, name: &str) -> Option<DeviceHandle> {
        self.lists[kind.index()]
            .iter()
            .copied()
            .find(|h| self.devices[h.0].name == name)
    }

    pub fn device(&self, handle: DeviceHandle) -> &Device {
        &self.devices[handle.0]
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> &mut Device {
        &mut self.devices[handle.0]
    }

    pub fn payload(&self, handle: DeviceHandle) -> &Payload {
        &self.devices[handle.0].payload
    }

    pub fn payload_mut(&mut self, handle: DeviceHandle) -> &mut Payload {
        &mut self.devices[handle.0].payload
    }

    /// Handles of one kind in list order.
    pub fn handles(&self, kind: DeviceKind) -> &[DeviceHandle] {
        &self.lists[kind.index()]
    }

    /// Devices of one kind in list order.
    pub fn devices(&self, kind: DeviceKind) -> impl Iterator<Item = (DeviceHandle, &Device)> {
        self.lists[kind.index()]
            .iter()
            .map(move |&h| (h, &self.devices[h.0]))
    }

    /// Handles of one kind that belong to `host`, in list order.
    pub fn host_handles(&self, kind: DeviceKind, host: HostId) -> Vec<DeviceHandle> {
        self.lists[kind.index()]
            .iter()
            .copied()
            .filter(|h| self.devices[h.0].host == Some(host.0))
            .collect()
    }

    pub fn host_of(&self, handle: DeviceHandle) -> Option<HostId> {
        self.devices[handle.0].host.map(HostId)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (HostId, &RemoteHost)> {
        self.hosts.iter().enumerate().map(|(i, h)| (HostId(i), h))
    }

    pub fn host(&self, id: HostId) -> &RemoteHost {
        &self.hosts[id.0]
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Replace one kind's list order. `order` must be a permutation of the current list.
    pub(crate) fn reorder(&mut self, kind: DeviceKind, order: Vec<DeviceHandle>) {
        debug_assert_eq!(order.len(), self.lists[kind.index()].len());
        self.lists[kind.index()] = order;
    }

    /// Forget the correlation ids of one kind before it is reconciled again.
    pub(crate) fn clear_ids(&mut self, kind: DeviceKind) {
        for h in &self.lists[kind.index()] {
            self.devices[h.0].id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ColorMode, Element};

    #[test]
    fn lists_keep_insertion_order() {
        let mut reg = Registry::client();
        let b = reg.register(Registration::sense("beta", 1, 1, Element::Byte)).unwrap();
        let a = reg.register(Registration::sense("alpha", 1, 1, Element::Byte)).unwrap();
        let v = reg.register(Registration::value("V1", 2)).unwrap();
        assert_eq!(reg.handles(DeviceKind::Sense), &[b, a]);
        assert_eq!(reg.handles(DeviceKind::Value), &[v]);
        let names: Vec<&str> = reg.devices(DeviceKind::Sense).map(|(_, d)| d.name()).collect();
        assert_eq!(names, ["beta", "alpha"]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn duplicate_names_rejected_per_kind() {
        let mut reg = Registry::client();
        reg.register(Registration::value("X", 1)).unwrap();
        assert!(matches!(
            reg.register(Registration::value("X", 2)),
            Err(RegistryError::DuplicateName { .. })
        ));
        reg.register(Registration::effector("X", 1, 1)).unwrap();
    }

    #[test]
    fn server_hosts_dedup_by_host_and_port() {
        let mut reg = Registry::server().with_default_port(7000);
        let a = reg.register(Registration::sense("S1", 2, 2, Element::Byte)).unwrap();
        let b = reg
            .register(Registration::effector("E1", 1, 3).on_host(HostSpec {
                host: Some(String::new()),
                port: None,
            }))
            .unwrap();
        let c = reg
            .register(
                Registration::camera(DeviceKind::TrialCamera, "C1", 4, 4, ColorMode::Gray8).on_host(HostSpec {
                    host: Some("robot".into()),
                    port: Some(7000),
                }),
            )
            .unwrap();
        assert_eq!(reg.host_of(a), reg.host_of(b));
        assert_ne!(reg.host_of(a), reg.host_of(c));
        assert_eq!(reg.host_count(), 2);
        let (_, first) = reg.hosts().next().unwrap();
        assert_eq!(first, &RemoteHost { host: String::new(), port: 7000 });
        assert_eq!(first.listen_name(), ":7000");
    }

    #[test]
    fn client_rejects_hosts_and_server_rejects_deferred() {
        let mut client = Registry::client();
        assert!(matches!(
            client.register(Registration::value("V", 1).on_host(HostSpec::default())),
            Err(RegistryError::HostNotAllowed { .. })
        ));
        client.register(Registration::deferred_effector("E")).unwrap();

        let mut server = Registry::server();
        assert!(matches!(
            server.register(Registration::deferred_effector("E")),
            Err(RegistryError::DeferredLength { .. })
        ));
    }

    #[test]
    fn payloads_sized_at_registration() {
        let mut reg = Registry::client();
        let s = reg.register(Registration::sense("S1", 4, 4, Element::Byte)).unwrap();
        let e = reg.register(Registration::effector("E1", 1, 3).with_modality()).unwrap();
        assert_eq!(reg.payload(s).as_bytes().unwrap().len(), 16);
        assert_eq!(reg.payload(e).as_floats().unwrap().len(), 3);
        assert_eq!(reg.device(e).modality, Some((0, 0)));
        reg.payload_mut(s).as_bytes_mut().unwrap()[0] = 9;
        assert_eq!(reg.payload(s).as_bytes().unwrap()[0], 9);
    }

    #[test]
    fn find_by_name_is_kind_scoped() {
        let mut reg = Registry::client();
        let s = reg.register(Registration::sense("N", 1, 1, Element::Float)).unwrap();
        assert_eq!(reg.find_by_name(DeviceKind::Sense, "N"), Some(s));
        assert_eq!(reg.find_by_name(DeviceKind::Value, "N"), None);
    }
}
