//! Load config from file and environment.

use anyhow::Context;
use bbd_core::{ColorMode, DeviceKind, Element, HostSpec, Registration, DEFAULT_DATA_PORT};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which end of the bridge this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Robot: connects, sends sensor data, receives effector data.
    #[default]
    Client,
    /// Simulator: listens, receives sensor data, sends effector data.
    Server,
}

/// Driver configuration. File: $BBD_CONFIG, ~/.config/bbd/config.toml or /etc/bbd/config.toml.
/// Env overrides: BBD_ROLE, BBD_HOST, BBD_DATA_PORT, BBD_BUFFER_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub role: Role,
    /// Server host for the client role; empty means loopback.
    #[serde(default)]
    pub host: String,
    /// Data port (default 9601).
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Channel buffer size; 0 picks the channel default.
    #[serde(default)]
    pub buffer_size: usize,
    /// Cycles to run; 0 runs until signalled or terminated by the peer.
    #[serde(default)]
    pub cycles: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            host: String::new(),
            data_port: default_data_port(),
            buffer_size: 0,
            cycles: 0,
            log_level: default_log_level(),
            devices: Vec::new(),
        }
    }
}

/// One `[[device]]` table. Which geometry fields apply depends on `kind`; missing ones
/// read as zero and are rejected at registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub kind: DeviceKind,
    pub name: String,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub count: Option<u32>,
    #[serde(default)]
    pub element: Element,
    #[serde(default)]
    pub color: ColorMode,
    #[serde(default)]
    pub modality: bool,
    #[serde(default)]
    pub unused: bool,
    /// Server role only: host the device's data goes to or comes from.
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl DeviceEntry {
    pub fn registration(&self) -> Registration {
        let dim = |v: Option<u32>| v.unwrap_or(0);
        let mut reg = match self.kind {
            DeviceKind::Sense => Registration::sense(&self.name, dim(self.rows), dim(self.cols), self.element),
            DeviceKind::TrialCamera | DeviceKind::EventCamera | DeviceKind::SeriesCamera => {
                Registration::camera(self.kind, &self.name, dim(self.width), dim(self.height), self.color)
            }
            DeviceKind::Value => Registration::value(&self.name, dim(self.count)),
            DeviceKind::Effector => match (self.rows, self.cols) {
                (None, None) => Registration::deferred_effector(&self.name),
                (rows, cols) => Registration::effector(&self.name, dim(rows), dim(cols)),
            },
        };
        if self.modality {
            reg = reg.with_modality();
        }
        if self.unused {
            reg = reg.unused();
        }
        if self.host.is_some() || self.port.is_some() {
            reg = reg.on_host(HostSpec {
                host: self.host.clone(),
                port: self.port,
            });
        }
        reg
    }
}

/// Load config: explicit path or search path, then env vars. A file that exists but does
/// not parse is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BBD_ROLE") {
        match s.to_ascii_lowercase().as_str() {
            "client" => c.role = Role::Client,
            "server" => c.role = Role::Server,
            _ => {}
        }
    }
    if let Some(s) = var("BBD_HOST") {
        c.host = s;
    }
    if let Some(s) = var("BBD_DATA_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.data_port = p;
        }
    }
    if let Some(s) = var("BBD_BUFFER_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.buffer_size = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("BBD_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/bbd/config.toml"));
    }
    out.push(PathBuf::from("/etc/bbd/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbd_core::{Geometry, Registry};

    const MANIFEST: &str = r#"
role = "server"
data_port = 9700
cycles = 5

[[device]]
kind = "sense"
name = "S1"
rows = 4
cols = 4

[[device]]
kind = "trial-camera"
name = "EYE"
width = 16
height = 12
color = "rgb24"
modality = true

[[device]]
kind = "effector"
name = "E1"
rows = 1
cols = 3
host = "robot"
port = 9702
"#;

    #[test]
    fn defaults_when_empty() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.data_port, 9601);
        assert_eq!(c.log_level, "info");
        assert!(c.devices.is_empty());
    }

    #[test]
    fn manifest_parses_and_registers() {
        let c: Config = toml::from_str(MANIFEST).unwrap();
        assert_eq!(c.role, Role::Server);
        assert_eq!(c.cycles, 5);
        assert_eq!(c.devices.len(), 3);

        let mut reg = Registry::server().with_default_port(c.data_port);
        for d in &c.devices {
            reg.register(d.registration()).unwrap();
        }
        assert_eq!(reg.host_count(), 2);
        let eye = reg.find_by_name(DeviceKind::TrialCamera, "EYE").unwrap();
        assert_eq!(reg.device(eye).byte_len(), 16 * 12 * 3);
        assert!(reg.device(eye).has_modality());
        let hosts: Vec<(String, u16)> = reg.hosts().map(|(_, h)| (h.host.clone(), h.port)).collect();
        assert_eq!(hosts, [(String::new(), 9700), ("robot".to_string(), 9702)]);
    }

    #[test]
    fn effector_without_dims_is_deferred() {
        let c: Config = toml::from_str("[[device]]\nkind = \"effector\"\nname = \"ARM\"\n").unwrap();
        let reg = c.devices[0].registration();
        assert!(matches!(reg.geometry, Geometry::Effector(bbd_core::EffectorShape::Deferred)));
    }

    #[test]
    fn missing_geometry_rejected_at_registration() {
        let c: Config = toml::from_str("[[device]]\nkind = \"value\"\nname = \"V1\"\n").unwrap();
        let mut reg = Registry::client();
        assert!(reg.register(c.devices[0].registration()).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("colour = 1").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "BBD_ROLE" => Some("Server".into()),
            "BBD_HOST" => Some("sim.local".into()),
            "BBD_DATA_PORT" => Some("9800".into()),
            "BBD_BUFFER_SIZE" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(c.role, Role::Server);
        assert_eq!(c.host, "sim.local");
        assert_eq!(c.data_port, 9800);
        assert_eq!(c.buffer_size, 0);
    }

    #[test]
    fn explicit_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbd.toml");
        std::fs::write(&path, "role = \"client\"\nhost = \"sim\"\n").unwrap();
        let c = load_file(&path).unwrap();
        assert_eq!(c.host, "sim");
        std::fs::write(&path, "role = 3").unwrap();
        assert!(load_file(&path).is_err());
    }
}
