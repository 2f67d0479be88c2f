//! Configuration for the resolver, outlets and inlets.

use crate::clock::ClockSyncConfig;
use eyre::{Result, WrapErr, ensure};
use serde::Deserialize;
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

/// Environment variable naming a YAML file read by [Config::from_env].
pub const CONFIG_ENV: &str = "LABSTREAM_CONFIG";

/// Well-known port of the discovery channel.
pub const DISCOVERY_PORT: u16 = 16571;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub outlet: OutletConfig,
    pub inlet: InletConfig,
    pub clock: ClockSyncConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `LABSTREAM_CONFIG`, or fall back to the
    /// defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let Self {
            discovery,
            outlet,
            inlet,
            clock,
        } = self;

        discovery.validate()?;

        ensure!(
            outlet.queue_capacity > 0,
            "outlet.queue_capacity must be greater than zero"
        );
        ensure!(
            inlet.max_buffer_len > 0,
            "inlet.max_buffer_len must be greater than zero"
        );
        ensure!(
            inlet.liveness_timeout > clock.probe_interval,
            "inlet.liveness_timeout must exceed clock.probe_interval"
        );

        ensure!(
            !clock.probe_interval.is_zero(),
            "clock.probe_interval must be greater than zero"
        );
        ensure!(clock.window_size > 0, "clock.window_size must be greater than zero");
        ensure!(
            clock.reset_threshold > 0.0,
            "clock.reset_threshold must be positive"
        );

        Ok(())
    }
}

/// Discovery channel parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local address of the discovery socket.
    pub bind: SocketAddr,
    /// Destinations for announcements and queries. Broadcast, multicast
    /// and unicast addresses may be mixed.
    pub peers: Vec<SocketAddr>,
    /// Multicast group joined by the discovery socket, if any.
    pub multicast_group: Option<Ipv4Addr>,
    /// Hop limit of outgoing discovery datagrams.
    pub ttl: u32,
    /// Period of the advertisement broadcast.
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,
    /// Period at which an ongoing resolve re-sends its query.
    #[serde(with = "humantime_serde")]
    pub query_interval: Duration,
    /// Streams not heard of for this long are dropped from live views.
    #[serde(with = "humantime_serde")]
    pub forget_after: Duration,
    /// Only streams of this session are advertised and resolved.
    pub session_id: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)),
            peers: vec![SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT))],
            multicast_group: None,
            ttl: 1,
            announce_interval: Duration::from_secs(1),
            query_interval: Duration::from_millis(500),
            forget_after: Duration::from_secs(5),
            session_id: crate::info::DEFAULT_SESSION.to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Checks the discovery section on its own.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.announce_interval.is_zero(),
            "discovery.announce_interval must be greater than zero"
        );
        ensure!(
            !self.query_interval.is_zero(),
            "discovery.query_interval must be greater than zero"
        );
        ensure!(
            self.forget_after > self.announce_interval,
            "discovery.forget_after must exceed discovery.announce_interval"
        );
        ensure!(self.ttl > 0, "discovery.ttl must be greater than zero");
        Ok(())
    }

    /// Discovery confined to the loopback interface on an ephemeral port.
    /// Peers must be added explicitly.
    pub fn loopback() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            peers: Vec::new(),
            announce_interval: Duration::from_millis(200),
            query_interval: Duration::from_millis(100),
            forget_after: Duration::from_secs(1),
            ..Self::default()
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peers.push(peer);
        self
    }
}

/// Policy applied when an outlet's per-inlet queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the oldest queued sample to make room for the new one.
    /// Preserves real-time characteristics.
    #[default]
    DropOldest,

    /// Block the producer until the queue has room.
    /// Preserves completeness at the cost of latency.
    Block,
}

/// Outlet parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutletConfig {
    /// Local address of the data-plane listener.
    pub bind: SocketAddr,
    /// Maximum number of samples queued per connected inlet.
    pub queue_capacity: usize,
    /// Policy for handling queue overflow.
    pub backpressure: BackpressurePolicy,
    /// Samples retained while no inlet is connected and handed to the
    /// next inlet that connects. Zero drops them.
    pub pre_connection_buffer: usize,
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            queue_capacity: 4096,
            backpressure: BackpressurePolicy::DropOldest,
            pre_connection_buffer: 0,
        }
    }
}

impl OutletConfig {
    /// Drop-oldest queues for live sensors.
    pub fn realtime(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            backpressure: BackpressurePolicy::DropOldest,
            ..Self::default()
        }
    }

    /// Blocking queues that never lose a sample once an inlet is
    /// connected.
    pub fn lossless(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            backpressure: BackpressurePolicy::Block,
            ..Self::default()
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_pre_connection_buffer(mut self, len: usize) -> Self {
        self.pre_connection_buffer = len;
        self
    }
}

/// Timestamp post-processing applied by an inlet on pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PostProcessing {
    /// Add the current clock offset to each timestamp.
    pub clocksync: bool,
    /// Smooth the timestamps of regular-rate streams.
    pub dejitter: bool,
    /// Force timestamps to be non-decreasing.
    pub monotonize: bool,
}

impl PostProcessing {
    pub fn all() -> Self {
        Self {
            clocksync: true,
            dejitter: true,
            monotonize: true,
        }
    }

    pub fn is_none(&self) -> bool {
        !(self.clocksync || self.dejitter || self.monotonize)
    }
}

/// Inlet parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InletConfig {
    /// Capacity of the receive buffer, in samples.
    pub max_buffer_len: usize,
    /// Silence on the connection longer than this marks the stream lost.
    #[serde(with = "humantime_serde")]
    pub liveness_timeout: Duration,
    /// Deadline for connecting and completing the handshake.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub postprocessing: PostProcessing,
}

impl Default for InletConfig {
    fn default() -> Self {
        Self {
            max_buffer_len: 360 * 100,
            liveness_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            postprocessing: PostProcessing::default(),
        }
    }
}

impl InletConfig {
    pub fn with_buffer_len(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = max_buffer_len;
        self
    }

    pub fn with_postprocessing(mut self, postprocessing: PostProcessing) -> Self {
        self.postprocessing = postprocessing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_load_yaml_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
discovery:
  bind: "127.0.0.1:0"
  peers: ["127.0.0.1:16571"]
  announce_interval: 250ms
  forget_after: 3s
outlet:
  queue_capacity: 64
  backpressure: block
inlet:
  max_buffer_len: 128
  postprocessing:
    clocksync: true
clock:
  probe_interval: 2s
  window_size: 8
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.discovery.announce_interval, Duration::from_millis(250));
        assert_eq!(config.discovery.peers.len(), 1);
        assert_eq!(config.outlet.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.inlet.max_buffer_len, 128);
        assert!(config.inlet.postprocessing.clocksync);
        assert!(!config.inlet.postprocessing.dejitter);
        assert_eq!(config.clock.window_size, 8);
        assert_eq!(config.clock.probe_burst, ClockSyncConfig::default().probe_burst);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = Config::default();
        config.inlet.max_buffer_len = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.outlet.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_short_liveness_timeout() {
        let mut config = Config::default();
        config.inlet.liveness_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Config::load("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_presets() {
        assert_eq!(OutletConfig::realtime(16).backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(OutletConfig::lossless(16).backpressure, BackpressurePolicy::Block);
        assert!(PostProcessing::default().is_none());
        assert!(!PostProcessing::all().is_none());
    }
}
