//! Transport detector: config-driven probing of serial ports and socket
//! endpoints.
//!
//! A once-per-second watchdog walks every configured port that is
//! currently unconnected. Serial ports are enumerated, matched against the
//! configured name pattern (minus the exclusion list), optionally guarded
//! by the cross-process arbiter, opened at the current baud rate and
//! handed to the registered detector. A detector that recognizes its
//! protocol simply keeps the stream; one that does not calls
//! [`TransportDetector::protocol_not_detected`], which advances to the
//! next baud/detector and lets the next watchdog tick reopen the port.
//! TCP, UDP and proxy endpoints are (re)created the same way; the proxy
//! variant additionally validates a five byte `VSMP` handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;

use crate::arbiter::SerialArbiter;
use crate::error::{Error, IoResult, Result};
use crate::io::addr::SocketAddress;
use crate::io::dispatcher::Offset;
use crate::io::serial::{SerialMode, SerialProcessor};
use crate::io::socket::SocketProcessor;
use crate::io::stream::IoStream;
use crate::request::container::RequestContainer;
use crate::request::request::{Request, ResultCode};
use crate::request::worker::RequestWorker;
use crate::sync::Mutex;
use crate::timer::{Timer, TimerProcessor};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROXY_SIGNATURE: &[u8; 4] = b"VSMP";
const PROXY_PROTOCOL_VERSION: u8 = 0x02;

/// Invoked with (port name, baud rate, negotiated stream) whenever a port
/// opened. The detector either keeps the stream, or reports
/// `protocol_not_detected` to resume probing.
pub type ConnectHandler =
  Arc<dyn Fn(String, u32, Arc<dyn IoStream>) + Send + Sync + 'static>;

/// Transport configuration for one detector prefix, parsed from
/// `Properties`-style key/value pairs (the file parser itself lives with
/// the application).
#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
  pub use_serial_arbiter: bool,
  pub excludes: Vec<String>,
  pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortConfig {
  Serial { name_pattern: String, bauds: Vec<u32> },
  TcpOut { address: String, port: String },
  UdpIn { local_address: String, local_port: String },
  UdpOut {
    address: String,
    port: String,
    local_address: Option<String>,
    local_port: Option<String>,
  },
  Proxy { address: String, port: String },
}

impl DetectorConfig {
  /// Collects the `<prefix>.*` keys out of a flat key/value view.
  ///
  /// Recognized patterns:
  /// `<p>.use_serial_arbiter`, `<p>.exclude.<n>`, `<p>.<id>.name`,
  /// `<p>.<id>.baud[.<n>]`, `<p>.<id>.address` + `<p>.<id>.tcp_port`,
  /// `<p>.<id>.udp_local_address`/`udp_local_port`,
  /// `<p>.<id>.udp_address`/`udp_port`,
  /// `<p>.<id>.proxy_address`/`proxy_port`.
  pub fn from_pairs<'a>(
    prefix: &str,
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
  ) -> Result<DetectorConfig> {
    let mut config = DetectorConfig {
      use_serial_arbiter: true,
      excludes: Vec::new(),
      ports: Vec::new(),
    };
    let mut by_id: HashMap<String, HashMap<String, String>> = HashMap::new();

    let full_prefix = format!("{prefix}.");
    for (key, value) in pairs {
      let Some(rest) = key.strip_prefix(&full_prefix) else { continue };
      if rest == "use_serial_arbiter" {
        config.use_serial_arbiter =
          matches!(value, "yes" | "true" | "1" | "on");
        continue;
      }
      if let Some(_n) = rest.strip_prefix("exclude.") {
        config.excludes.push(value.to_string());
        continue;
      }
      let Some((id, attr)) = rest.split_once('.') else { continue };
      by_id
        .entry(id.to_string())
        .or_default()
        .insert(attr.to_string(), value.to_string());
    }

    let mut ids: Vec<_> = by_id.keys().cloned().collect();
    ids.sort();
    for id in ids {
      let attrs = &by_id[&id];
      if let Some(pattern) = attrs.get("name") {
        let mut bauds = Vec::new();
        let mut baud_keys: Vec<_> = attrs
          .keys()
          .filter(|k| *k == "baud" || k.starts_with("baud."))
          .cloned()
          .collect();
        baud_keys.sort();
        for key in baud_keys {
          let value = &attrs[&key];
          let baud = value.parse::<u32>().map_err(|_| {
            Error::Parse(format!("bad baud rate {value:?} for port {id}"))
          })?;
          bauds.push(baud);
        }
        if bauds.is_empty() {
          return Err(Error::Parse(format!(
            "serial port {id} has no baud rates"
          )));
        }
        config.ports.push(PortConfig::Serial {
          name_pattern: pattern.clone(),
          bauds,
        });
      } else if let Some(port) = attrs.get("tcp_port") {
        let address = attrs.get("address").cloned().ok_or_else(|| {
          Error::Parse(format!("tcp port {id} has no address"))
        })?;
        config.ports.push(PortConfig::TcpOut { address, port: port.clone() });
      } else if let Some(port) = attrs.get("udp_local_port")
        && !attrs.contains_key("udp_port")
      {
        config.ports.push(PortConfig::UdpIn {
          local_address: attrs
            .get("udp_local_address")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0".into()),
          local_port: port.clone(),
        });
      } else if let Some(port) = attrs.get("udp_port") {
        let address = attrs.get("udp_address").cloned().ok_or_else(|| {
          Error::Parse(format!("udp port {id} has no udp_address"))
        })?;
        config.ports.push(PortConfig::UdpOut {
          address,
          port: port.clone(),
          local_address: attrs.get("udp_local_address").cloned(),
          local_port: attrs.get("udp_local_port").cloned(),
        });
      } else if let Some(port) = attrs.get("proxy_port") {
        let address = attrs.get("proxy_address").cloned().ok_or_else(|| {
          Error::Parse(format!("proxy port {id} has no proxy_address"))
        })?;
        config.ports.push(PortConfig::Proxy { address, port: port.clone() });
      } else {
        return Err(Error::Parse(format!(
          "port {id} matches no known transport shape"
        )));
      }
    }
    Ok(config)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
  None,
  Connecting,
  Connected,
}

#[derive(Clone)]
struct DetectorEntry {
  baud: u32,
  handler: ConnectHandler,
  ctx: Arc<RequestContainer>,
}

enum PortKind {
  Serial { device: String },
  TcpOut { addr: SocketAddress },
  UdpIn { local: SocketAddress },
  UdpOut { local: Option<SocketAddress>, peer: SocketAddress },
  Proxy { addr: SocketAddress },
}

struct ActivePort {
  kind: PortKind,
  state: PortState,
  detectors: Vec<DetectorEntry>,
  /// Index of the detector entry to try next.
  current: usize,
  stream: Option<Arc<dyn IoStream>>,
  arbiter: Option<SerialArbiter>,
  use_arbiter: bool,
}

struct SerialTemplate {
  pattern: Regex,
  detectors: Vec<DetectorEntry>,
  use_arbiter: bool,
}

struct DetectorState {
  excludes: Vec<Regex>,
  serial_templates: Vec<SerialTemplate>,
  active: HashMap<String, ActivePort>,
}

/// Probing engine. One per process is typical; several can coexist.
pub struct TransportDetector {
  worker: Arc<RequestWorker>,
  container: Arc<RequestContainer>,
  timer_processor: Arc<TimerProcessor>,
  socket_processor: Arc<SocketProcessor>,
  serial_processor: Arc<SerialProcessor>,
  state: Mutex<DetectorState>,
  watchdog: Mutex<Option<Arc<Timer>>>,
  is_enabled: AtomicBool,
}

impl TransportDetector {
  pub fn new(
    timer_processor: Arc<TimerProcessor>,
    socket_processor: Arc<SocketProcessor>,
    serial_processor: Arc<SerialProcessor>,
  ) -> Arc<TransportDetector> {
    let (worker, container) = RequestWorker::single("transport detector");
    Arc::new(TransportDetector {
      worker,
      container,
      timer_processor,
      socket_processor,
      serial_processor,
      state: Mutex::new(DetectorState {
        excludes: Vec::new(),
        serial_templates: Vec::new(),
        active: HashMap::new(),
      }),
      watchdog: Mutex::new(None),
      is_enabled: AtomicBool::new(false),
    })
  }

  pub fn enable(self: &Arc<Self>) -> Result<()> {
    if self.is_enabled.swap(true, Ordering::AcqRel) {
      return Err(Error::InvalidOp("transport detector already enabled"));
    }
    self.worker.enable()?;
    let detector = Arc::clone(self);
    let timer = self.timer_processor.create_timer(
      WATCHDOG_INTERVAL,
      Box::new(move || {
        detector.on_timer();
        true
      }),
      Arc::clone(&self.container),
    )?;
    *self.watchdog.lock() = Some(timer);
    Ok(())
  }

  pub fn disable(&self) {
    if !self.is_enabled.swap(false, Ordering::AcqRel) {
      return;
    }
    if let Some(timer) = self.watchdog.lock().take() {
      timer.cancel();
    }
    let streams: Vec<_> = {
      let mut state = self.state.lock();
      state
        .active
        .drain()
        .filter_map(|(_, port)| port.stream)
        .collect()
    };
    for stream in streams {
      stream.close();
    }
    self.worker.disable();
  }

  /// Registers `config` with a protocol detector callback executing in
  /// `ctx`. May be called multiple times with different prefixes.
  pub fn add_detector(
    self: &Arc<Self>,
    config: &DetectorConfig,
    handler: ConnectHandler,
    ctx: Arc<RequestContainer>,
  ) -> Result<()> {
    let mut excludes = Vec::new();
    for pattern in &config.excludes {
      excludes.push(Regex::new(pattern).map_err(|e| {
        Error::Parse(format!("bad exclude pattern {pattern:?}: {e}"))
      })?);
    }
    let mut state = self.state.lock();
    state.excludes.append(&mut excludes);
    for port in &config.ports {
      match port {
        PortConfig::Serial { name_pattern, bauds } => {
          let pattern = Regex::new(name_pattern).map_err(|e| {
            Error::Parse(format!("bad port pattern {name_pattern:?}: {e}"))
          })?;
          let detectors = bauds
            .iter()
            .map(|baud| DetectorEntry {
              baud: *baud,
              handler: Arc::clone(&handler),
              ctx: Arc::clone(&ctx),
            })
            .collect();
          state.serial_templates.push(SerialTemplate {
            pattern,
            detectors,
            use_arbiter: config.use_serial_arbiter,
          });
        }
        PortConfig::TcpOut { address, port } => {
          let key = format!("tcp:{address}:{port}");
          state.active.entry(key).or_insert(ActivePort {
            kind: PortKind::TcpOut {
              addr: SocketAddress::new(address.clone(), port.clone()),
            },
            state: PortState::None,
            detectors: vec![DetectorEntry {
              baud: 0,
              handler: Arc::clone(&handler),
              ctx: Arc::clone(&ctx),
            }],
            current: 0,
            stream: None,
            arbiter: None,
            use_arbiter: false,
          });
        }
        PortConfig::UdpIn { local_address, local_port } => {
          let key = format!("udp-in:{local_address}:{local_port}");
          state.active.entry(key).or_insert(ActivePort {
            kind: PortKind::UdpIn {
              local: SocketAddress::new(
                local_address.clone(),
                local_port.clone(),
              ),
            },
            state: PortState::None,
            detectors: vec![DetectorEntry {
              baud: 0,
              handler: Arc::clone(&handler),
              ctx: Arc::clone(&ctx),
            }],
            current: 0,
            stream: None,
            arbiter: None,
            use_arbiter: false,
          });
        }
        PortConfig::UdpOut { address, port, local_address, local_port } => {
          let key = format!("udp-out:{address}:{port}");
          let local = match (local_address, local_port) {
            (None, None) => None,
            (addr, port) => Some(SocketAddress::new(
              addr.clone().unwrap_or_else(|| "0.0.0.0".into()),
              port.clone().unwrap_or_else(|| "0".into()),
            )),
          };
          state.active.entry(key).or_insert(ActivePort {
            kind: PortKind::UdpOut {
              local,
              peer: SocketAddress::new(address.clone(), port.clone()),
            },
            state: PortState::None,
            detectors: vec![DetectorEntry {
              baud: 0,
              handler: Arc::clone(&handler),
              ctx: Arc::clone(&ctx),
            }],
            current: 0,
            stream: None,
            arbiter: None,
            use_arbiter: false,
          });
        }
        PortConfig::Proxy { address, port } => {
          let key = format!("proxy:{address}:{port}");
          state.active.entry(key).or_insert(ActivePort {
            kind: PortKind::Proxy {
              addr: SocketAddress::new(address.clone(), port.clone()),
            },
            state: PortState::None,
            detectors: vec![DetectorEntry {
              baud: 0,
              handler: Arc::clone(&handler),
              ctx: Arc::clone(&ctx),
            }],
            current: 0,
            stream: None,
            arbiter: None,
            use_arbiter: false,
          });
        }
      }
    }
    Ok(())
  }

  /// Reports that the protocol was not recognized on `stream`. The stream
  /// is closed, the port advances to its next baud/detector and returns to
  /// probing.
  pub fn protocol_not_detected(&self, stream: &Arc<dyn IoStream>) {
    let mut state = self.state.lock();
    for port in state.active.values_mut() {
      let matches = port
        .stream
        .as_ref()
        .map(|s| Arc::ptr_eq(s, stream))
        .unwrap_or(false);
      if !matches {
        continue;
      }
      port.stream = None;
      port.arbiter = None;
      port.state = PortState::None;
      port.current = (port.current + 1) % port.detectors.len().max(1);
      break;
    }
    drop(state);
    stream.close();
  }

  /// Watchdog body, runs on the detector's own container.
  fn on_timer(self: &Arc<Self>) {
    self.scan_serial_ports();
    self.reap_closed_streams();
    let keys: Vec<String> = {
      let state = self.state.lock();
      state
        .active
        .iter()
        .filter(|(_, port)| port.state == PortState::None)
        .map(|(key, _)| key.clone())
        .collect()
    };
    for key in keys {
      self.probe_port(&key);
    }
  }

  /// Turns serial templates into active ports for every present device.
  fn scan_serial_ports(&self) {
    let devices = SerialProcessor::enumerate_ports();
    let mut state = self.state.lock();
    let state = &mut *state;
    for device in devices {
      if state.excludes.iter().any(|re| re.is_match(&device)) {
        continue;
      }
      if state.active.contains_key(&device) {
        continue;
      }
      for template in &state.serial_templates {
        if !template.pattern.is_match(&device) {
          continue;
        }
        state.active.insert(
          device.clone(),
          ActivePort {
            kind: PortKind::Serial { device: device.clone() },
            state: PortState::None,
            detectors: template.detectors.clone(),
            current: 0,
            stream: None,
            arbiter: None,
            use_arbiter: template.use_arbiter,
          },
        );
        break;
      }
    }
  }

  /// A connected stream closed by its upper layer returns the port to
  /// probing; a vanished serial device is forgotten entirely.
  fn reap_closed_streams(&self) {
    let mut state = self.state.lock();
    let mut vanished = Vec::new();
    for (key, port) in state.active.iter_mut() {
      let closed = port
        .stream
        .as_ref()
        .map(|s| s.is_closed())
        .unwrap_or(false);
      if !closed {
        continue;
      }
      port.stream = None;
      port.arbiter = None;
      port.state = PortState::None;
      if let PortKind::Serial { device } = &port.kind
        && !std::path::Path::new(device).exists()
      {
        vanished.push(key.clone());
      }
    }
    for key in vanished {
      state.active.remove(&key);
    }
  }

  fn probe_port(self: &Arc<Self>, key: &str) {
    enum Plan {
      Serial { device: String, entry: DetectorEntry, use_arbiter: bool },
      TcpOut { addr: SocketAddress },
      UdpIn { local: SocketAddress },
      UdpOut { local: Option<SocketAddress>, peer: SocketAddress },
      Proxy { addr: SocketAddress },
    }

    let plan = {
      let mut state = self.state.lock();
      let Some(port) = state.active.get_mut(key) else { return };
      if port.state != PortState::None || port.detectors.is_empty() {
        return;
      }
      let entry = port.detectors[port.current % port.detectors.len()].clone();
      port.state = PortState::Connecting;
      match &port.kind {
        PortKind::Serial { device } => Plan::Serial {
          device: device.clone(),
          entry,
          use_arbiter: port.use_arbiter,
        },
        PortKind::TcpOut { addr } => Plan::TcpOut { addr: addr.clone() },
        PortKind::UdpIn { local } => Plan::UdpIn { local: local.clone() },
        PortKind::UdpOut { local, peer } => {
          Plan::UdpOut { local: local.clone(), peer: peer.clone() }
        }
        PortKind::Proxy { addr } => Plan::Proxy { addr: addr.clone() },
      }
    };

    match plan {
      Plan::Serial { device, entry, use_arbiter } => {
        self.probe_serial(key, &device, entry, use_arbiter);
      }
      Plan::TcpOut { addr } => self.probe_tcp(key, addr, false),
      Plan::Proxy { addr } => self.probe_tcp(key, addr, true),
      Plan::UdpIn { local } => {
        let detector = Arc::clone(self);
        let key_owned = key.to_string();
        let result = self.socket_processor.bind_udp(
          local,
          None,
          Box::new(move |result, stream| match (result, stream) {
            (IoResult::Ok, Some(stream)) => {
              detector.port_opened(
                &key_owned,
                stream as Arc<dyn IoStream>,
                0,
              );
            }
            _ => detector.port_failed(&key_owned),
          }),
          &self.container,
        );
        if result.is_err() {
          self.port_failed(key);
        }
      }
      Plan::UdpOut { local, peer } => {
        let detector = Arc::clone(self);
        let key_owned = key.to_string();
        let local = local
          .unwrap_or_else(|| SocketAddress::new("0.0.0.0", "0"));
        let result = self.socket_processor.bind_udp(
          local,
          Some(peer),
          Box::new(move |result, stream| match (result, stream) {
            (IoResult::Ok, Some(stream)) => {
              detector.port_opened(
                &key_owned,
                stream as Arc<dyn IoStream>,
                0,
              );
            }
            _ => detector.port_failed(&key_owned),
          }),
          &self.container,
        );
        if result.is_err() {
          self.port_failed(key);
        }
      }
    }
  }

  fn probe_serial(
    self: &Arc<Self>,
    key: &str,
    device: &str,
    entry: DetectorEntry,
    use_arbiter: bool,
  ) {
    let arbiter = if use_arbiter {
      match SerialArbiter::acquire(device) {
        Ok(arbiter) => Some(arbiter),
        Err(_) => {
          // Another process probes this device right now.
          self.port_failed(key);
          return;
        }
      }
    } else {
      None
    };
    let mode = SerialMode { baud: entry.baud, ..Default::default() };
    match self.serial_processor.open(device, &mode) {
      Ok(stream) => {
        {
          let mut state = self.state.lock();
          if let Some(port) = state.active.get_mut(key) {
            port.arbiter = arbiter;
          }
        }
        self.port_opened(key, stream as Arc<dyn IoStream>, entry.baud);
      }
      Err(err) => {
        tracing::debug!(device, %err, "serial open failed");
        self.port_failed(key);
      }
    }
  }

  fn probe_tcp(
    self: &Arc<Self>,
    key: &str,
    addr: SocketAddress,
    proxy: bool,
  ) {
    let detector = Arc::clone(self);
    let key_owned = key.to_string();
    let result = self.socket_processor.connect(
      addr,
      Box::new(move |result, stream| match (result, stream) {
        (IoResult::Ok, Some(stream)) => {
          if proxy {
            detector.verify_proxy_handshake(&key_owned, stream);
          } else {
            detector.port_opened(
              &key_owned,
              stream as Arc<dyn IoStream>,
              0,
            );
          }
        }
        _ => detector.port_failed(&key_owned),
      }),
      &self.container,
    );
    match result {
      Ok(waiter) => {
        let timeout = waiter.timeout(
          &self.timer_processor,
          TCP_CONNECT_TIMEOUT,
          None,
          true,
          Arc::clone(&self.container),
        );
        if let Err(err) = timeout {
          tracing::debug!(%err, "connect timeout arming failed");
        }
      }
      Err(_) => self.port_failed(key),
    }
  }

  /// The proxy announces itself with `VSMP` plus a protocol version byte;
  /// anything else closes the stream and retries next tick.
  fn verify_proxy_handshake(
    self: &Arc<Self>,
    key: &str,
    stream: Arc<crate::io::socket::SocketStream>,
  ) {
    let detector = Arc::clone(self);
    let key_owned = key.to_string();
    let stream2 = Arc::clone(&stream);
    let result = stream.read(
      5,
      5,
      Offset::None,
      Box::new(move |result, data| {
        let good = result == IoResult::Ok
          && data.len() == 5
          && &data.as_slice()[..4] == PROXY_SIGNATURE
          && data.as_slice()[4] == PROXY_PROTOCOL_VERSION;
        if good {
          detector.port_opened(&key_owned, stream2 as Arc<dyn IoStream>, 0);
        } else {
          tracing::info!(key = %key_owned, "proxy handshake mismatch");
          stream2.close();
          detector.port_failed(&key_owned);
        }
      }),
      &self.container,
    );
    if result.is_err() {
      stream.close();
      self.port_failed(key);
    }
  }

  /// Marks the port connected and hands the stream to the detector entry
  /// in its own execution context.
  fn port_opened(
    self: &Arc<Self>,
    key: &str,
    stream: Arc<dyn IoStream>,
    baud: u32,
  ) {
    let entry = {
      let mut state = self.state.lock();
      let Some(port) = state.active.get_mut(key) else {
        stream.close();
        return;
      };
      port.state = PortState::Connected;
      port.stream = Some(Arc::clone(&stream));
      port.detectors[port.current % port.detectors.len()].clone()
    };
    let name = key.to_string();
    let handler = Arc::clone(&entry.handler);
    let request = Request::new();
    let request2 = Arc::clone(&request);
    if request
      .set_processing_handler(Box::new(move || {
        handler(name, baud, stream);
        let _ = request2.complete(ResultCode::Ok);
      }))
      .is_err()
    {
      return;
    }
    if let Err(err) = entry.ctx.submit(request) {
      tracing::error!(%err, "detector handler dispatch failed");
    }
  }

  fn port_failed(&self, key: &str) {
    let mut state = self.state.lock();
    if let Some(port) = state.active.get_mut(key) {
      port.state = PortState::None;
      port.arbiter = None;
      port.current = (port.current + 1) % port.detectors.len().max(1);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_config_parsing_serial() {
    let pairs = [
      ("vehicle.apm.serial_port.use_serial_arbiter", "no"),
      ("vehicle.apm.serial_port.exclude.1", "/dev/ttyS.*"),
      ("vehicle.apm.serial_port.1.name", "/dev/ttyACM0"),
      ("vehicle.apm.serial_port.1.baud", "115200"),
      ("vehicle.apm.serial_port.2.name", "/dev/ttyUSB.*"),
      ("vehicle.apm.serial_port.2.baud.1", "57600"),
      ("vehicle.apm.serial_port.2.baud.2", "34800"),
      ("other.prefix.ignored", "yes"),
    ];
    let config =
      DetectorConfig::from_pairs("vehicle.apm.serial_port", pairs).unwrap();
    assert!(!config.use_serial_arbiter);
    assert_eq!(config.excludes, vec!["/dev/ttyS.*".to_string()]);
    assert_eq!(config.ports.len(), 2);
    assert_eq!(
      config.ports[0],
      PortConfig::Serial {
        name_pattern: "/dev/ttyACM0".into(),
        bauds: vec![115200]
      }
    );
    assert_eq!(
      config.ports[1],
      PortConfig::Serial {
        name_pattern: "/dev/ttyUSB.*".into(),
        bauds: vec![57600, 34800]
      }
    );
  }

  #[test]
  fn test_config_parsing_sockets() {
    let pairs = [
      ("link.1.address", "10.0.0.9"),
      ("link.1.tcp_port", "5762"),
      ("link.2.udp_local_port", "14550"),
      ("link.3.udp_address", "10.0.0.10"),
      ("link.3.udp_port", "14551"),
      ("link.4.proxy_address", "proxy.example"),
      ("link.4.proxy_port", "5566"),
    ];
    let config = DetectorConfig::from_pairs("link", pairs).unwrap();
    assert!(config.use_serial_arbiter);
    assert_eq!(config.ports.len(), 4);
    assert!(matches!(config.ports[0], PortConfig::TcpOut { .. }));
    assert!(matches!(config.ports[1], PortConfig::UdpIn { .. }));
    assert!(matches!(config.ports[2], PortConfig::UdpOut { .. }));
    assert!(matches!(config.ports[3], PortConfig::Proxy { .. }));
  }

  #[test]
  fn test_config_errors() {
    assert!(matches!(
      DetectorConfig::from_pairs(
        "p",
        [("p.1.name", "/dev/x"), ("p.1.baud", "fast")]
      ),
      Err(Error::Parse(_))
    ));
    assert!(matches!(
      DetectorConfig::from_pairs("p", [("p.1.name", "/dev/x")]),
      Err(Error::Parse(_))
    ));
    assert!(matches!(
      DetectorConfig::from_pairs("p", [("p.1.tcp_port", "80")]),
      Err(Error::Parse(_))
    ));
  }
}
