//! Cycle loops for both roles. Blocking; run on a worker thread and stopped through the
//! shared flag, checked once per cycle.

use std::sync::atomic::{AtomicBool, Ordering};

use bbd_core::{
    BbdClient, BbdServer, DeviceKind, Error, Exchange, ExchangeSignal, HandshakeState, Payload, Registry,
    RegistryError,
};
use tracing::{debug, info, trace};

use crate::config::{Config, Role};

/// Terminate reason sent when this side stops on its own.
pub const STOP_REASON: i32 = 0;

const INPUT_KINDS: [DeviceKind; 5] = [
    DeviceKind::Sense,
    DeviceKind::TrialCamera,
    DeviceKind::EventCamera,
    DeviceKind::SeriesCamera,
    DeviceKind::Value,
];

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Ran the configured number of cycles.
    Finished { cycles: u64 },
    /// Stopped by a signal.
    Stopped { cycles: u64 },
    /// The peer sent terminate.
    PeerTerminated { reason: i32, cycles: u64 },
    /// Client only: refused the session on purpose.
    Refused { reason: i32 },
}

pub fn run(cfg: &Config, refuse: Option<i32>, stop: &AtomicBool) -> Result<Outcome, Error> {
    match (cfg.role, refuse) {
        (Role::Client, Some(reason)) => {
            BbdClient::refuse(&cfg.host, cfg.data_port, cfg.buffer_size, reason)?;
            Ok(Outcome::Refused { reason })
        }
        (Role::Client, None) => run_client(cfg, stop),
        (Role::Server, _) => {
            let mut server = bind_server(cfg)?;
            serve(&mut server, cfg.cycles, stop)
        }
    }
}

/// Register every configured device, in file order, for this role.
pub fn build_registry(cfg: &Config) -> Result<Registry, RegistryError> {
    let mut registry = match cfg.role {
        Role::Client => Registry::client(),
        Role::Server => Registry::server().with_default_port(cfg.data_port),
    };
    for entry in &cfg.devices {
        registry.register(entry.registration())?;
    }
    Ok(registry)
}

fn limit_reached(limit: u64, cycles: u64) -> bool {
    limit != 0 && cycles >= limit
}

pub fn run_client(cfg: &Config, stop: &AtomicBool) -> Result<Outcome, Error> {
    let mut client = BbdClient::new(build_registry(cfg)?);
    let report = client.connect(&cfg.host, cfg.data_port, cfg.buffer_size)?;
    if report.state != HandshakeState::Established {
        if let Some(k) = report.kinds.iter().find(|k| k.mismatches > 0) {
            return Err(Error::HandshakeMismatch {
                kind: k.kind,
                sent: k.received as i32,
                reported: k.reply(),
            });
        }
    }
    info!(host = %cfg.host, port = cfg.data_port, "connected");

    let has_cameras = INPUT_KINDS
        .iter()
        .any(|&k| k.is_camera() && !client.registry().handles(k).is_empty());
    let mut cycles = 0u64;
    loop {
        if stop.load(Ordering::Relaxed) {
            client.terminate(STOP_REASON)?;
            return Ok(Outcome::Stopped { cycles });
        }
        if limit_reached(cfg.cycles, cycles) {
            client.terminate(STOP_REASON)?;
            return Ok(Outcome::Finished { cycles });
        }

        fill_inputs(client.registry_mut(), cycles);
        client.write_senses()?;
        if has_cameras {
            client.signal_event(ExchangeSignal::IMAGE_READY.bits())?;
        }
        for kind in [DeviceKind::TrialCamera, DeviceKind::EventCamera, DeviceKind::SeriesCamera] {
            client.write_cameras(kind)?;
        }
        client.write_values()?;
        if let Exchange::Terminated { reason } = client.read_effectors()? {
            info!(reason, cycles, "server terminated the session");
            return Ok(Outcome::PeerTerminated { reason, cycles });
        }
        let signal = client.poll_events(false)?;
        if !signal.is_empty() {
            trace!(?signal, "events");
        }
        cycles += 1;
        debug!(cycles, "cycle done");
    }
}

/// Bind every remote host's listener.
pub fn bind_server(cfg: &Config) -> Result<BbdServer, Error> {
    BbdServer::bind(build_registry(cfg)?, cfg.buffer_size)
}

/// Accept every host, then run cycles until the limit, a stop request or a peer
/// terminate. On its own stop the server sends terminate in place of the next effector
/// write, while the client is waiting for it.
pub fn serve(server: &mut BbdServer, limit: u64, stop: &AtomicBool) -> Result<Outcome, Error> {
    server.accept()?;
    info!(hosts = server.registry().host_count(), "session established");

    let mut cycles = 0u64;
    loop {
        for kind in INPUT_KINDS {
            let out = match kind {
                DeviceKind::Sense => server.read_senses()?,
                DeviceKind::Value => server.read_values()?,
                camera => server.read_cameras(camera)?,
            };
            if let Exchange::Terminated { reason } = out {
                info!(reason, cycles, "client terminated the session");
                server.close()?;
                return Ok(Outcome::PeerTerminated { reason, cycles });
            }
        }
        let signal = server.poll_events(&[])?;
        if !signal.is_empty() {
            trace!(?signal, "events");
        }

        let stopping = stop.load(Ordering::Relaxed);
        if stopping || limit_reached(limit, cycles) {
            server.terminate(STOP_REASON)?;
            return Ok(if stopping {
                Outcome::Stopped { cycles }
            } else {
                Outcome::Finished { cycles }
            });
        }

        drive_effectors(server.registry_mut());
        server.write_effectors()?;
        cycles += 1;
        debug!(cycles, "cycle done");
    }
}

/// Synthetic sensor data: bytes count up from the cycle number, floats hold it.
fn fill_inputs(registry: &mut Registry, cycle: u64) {
    for kind in INPUT_KINDS {
        for h in registry.handles(kind).to_vec() {
            match registry.payload_mut(h) {
                Payload::Bytes(b) => {
                    for (i, x) in b.iter_mut().enumerate() {
                        *x = (cycle as usize).wrapping_add(i) as u8;
                    }
                }
                Payload::Floats(f) => f.fill(cycle as f32),
            }
        }
    }
}

/// Every effector element gets the mean of all value inputs, or zero with none.
fn drive_effectors(registry: &mut Registry) {
    let (sum, n) = registry
        .devices(DeviceKind::Value)
        .filter_map(|(_, d)| d.payload.as_floats())
        .flatten()
        .fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
    let mean = if n == 0 { 0.0 } else { sum / n as f32 };
    for h in registry.handles(DeviceKind::Effector).to_vec() {
        if let Some(f) = registry.payload_mut(h).as_floats_mut() {
            f.fill(mean);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = r#"
[[device]]
kind = "sense"
name = "S1"
rows = 2
cols = 3

[[device]]
kind = "event-camera"
name = "EYE"
width = 4
height = 4

[[device]]
kind = "value"
name = "V1"
count = 2

[[device]]
kind = "effector"
name = "E1"
rows = 1
cols = 2
"#;

    fn configs(server_cycles: u64, client_cycles: u64) -> (Config, Config) {
        let mut server: Config = toml::from_str(&format!("role = \"server\"\ndata_port = 0\n{DEVICES}")).unwrap();
        server.cycles = server_cycles;
        let mut client: Config = toml::from_str(DEVICES).unwrap();
        client.cycles = client_cycles;
        (server, client)
    }

    fn session(server_cycles: u64, client_cycles: u64) -> (Outcome, Outcome) {
        let (server_cfg, mut client_cfg) = configs(server_cycles, client_cycles);
        let mut server = bind_server(&server_cfg).unwrap();
        let host = server.registry().hosts().next().map(|(id, _)| id).unwrap();
        client_cfg.data_port = server.local_port(host).unwrap();

        let robot = std::thread::spawn(move || run(&client_cfg, None, &AtomicBool::new(false)).unwrap());
        let served = serve(&mut server, server_cfg.cycles, &AtomicBool::new(false)).unwrap();
        (served, robot.join().unwrap())
    }

    #[test]
    fn server_limit_terminates_client() {
        let (served, robot) = session(3, 0);
        assert_eq!(served, Outcome::Finished { cycles: 3 });
        assert_eq!(
            robot,
            Outcome::PeerTerminated {
                reason: STOP_REASON,
                cycles: 3
            }
        );
    }

    #[test]
    fn client_limit_terminates_server() {
        let (served, robot) = session(0, 2);
        assert_eq!(robot, Outcome::Finished { cycles: 2 });
        assert_eq!(
            served,
            Outcome::PeerTerminated {
                reason: STOP_REASON,
                cycles: 2
            }
        );
    }

    #[test]
    fn stop_flag_checked_before_first_cycle() {
        let (server_cfg, mut client_cfg) = configs(0, 0);
        let mut server = bind_server(&server_cfg).unwrap();
        let host = server.registry().hosts().next().map(|(id, _)| id).unwrap();
        client_cfg.data_port = server.local_port(host).unwrap();

        let robot = std::thread::spawn(move || run(&client_cfg, None, &AtomicBool::new(true)).unwrap());
        let served = serve(&mut server, 0, &AtomicBool::new(false)).unwrap();
        assert_eq!(robot.join().unwrap(), Outcome::Stopped { cycles: 0 });
        assert_eq!(served, Outcome::PeerTerminated { reason: 0, cycles: 0 });
    }

    #[test]
    fn refusing_client_fails_accept() {
        let (server_cfg, mut client_cfg) = configs(0, 0);
        let mut server = bind_server(&server_cfg).unwrap();
        let host = server.registry().hosts().next().map(|(id, _)| id).unwrap();
        client_cfg.data_port = server.local_port(host).unwrap();

        let robot = std::thread::spawn(move || run(&client_cfg, Some(42), &AtomicBool::new(false)).unwrap());
        let err = serve(&mut server, 0, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, Error::PeerAborted { reason: 42 }));
        assert_eq!(robot.join().unwrap(), Outcome::Refused { reason: 42 });
    }

    #[test]
    fn client_registry_rejects_host_keys() {
        let cfg: Config =
            toml::from_str("[[device]]\nkind = \"value\"\nname = \"V1\"\ncount = 1\nport = 9700\n").unwrap();
        assert!(matches!(
            build_registry(&cfg),
            Err(RegistryError::HostNotAllowed { .. })
        ));
    }

    #[test]
    fn synthetic_data_flows_to_effectors() {
        let (server_cfg, _) = configs(0, 0);
        let mut reg = build_registry(&server_cfg).unwrap();
        let v1 = reg.find_by_name(DeviceKind::Value, "V1").unwrap();
        reg.payload_mut(v1).as_floats_mut().unwrap().copy_from_slice(&[1.0, 3.0]);
        drive_effectors(&mut reg);
        let e1 = reg.find_by_name(DeviceKind::Effector, "E1").unwrap();
        assert_eq!(reg.payload(e1).as_floats().unwrap(), &[2.0, 2.0]);

        fill_inputs(&mut reg, 255);
        let s1 = reg.find_by_name(DeviceKind::Sense, "S1").unwrap();
        assert_eq!(reg.payload(s1).as_bytes().unwrap(), &[255, 0, 1, 2, 3, 4]);
        assert_eq!(reg.payload(v1).as_floats().unwrap(), &[255.0, 255.0]);
    }
}
