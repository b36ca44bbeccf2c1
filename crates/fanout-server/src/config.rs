//! Relay configuration
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file (`fanout.toml`, or the path in `FANOUT_CONFIG`), and environment
//! variables such as `FANOUT__ICE__PORT_MIN=40000`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use fanout_protocol::{Codec, CodecParameters};
use serde::{Deserialize, Serialize};

use crate::pool::OverflowPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ice: IceConfig,
    pub dtls: DtlsConfig,
    pub pools: PoolsConfig,
    pub router: RouterConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
    pub log_format: LogFormat,
    /// Interval for the binary's periodic stats log; 0 disables it
    pub stats_interval_ms: u64,
    pub streams: Vec<StreamConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            dtls: DtlsConfig::default(),
            pools: PoolsConfig::default(),
            router: RouterConfig::default(),
            pipeline: PipelineConfig::default(),
            events: EventsConfig::default(),
            log_format: LogFormat::default(),
            stats_interval_ms: 10_000,
            streams: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load from the default file location and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FANOUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(Some(path.as_path()), Self::environment())
    }

    /// Environment source for `FANOUT__SECTION__KEY` variables
    pub fn environment() -> Environment {
        Environment::with_prefix("FANOUT")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("ice.host_addresses")
    }

    pub fn load_from(file: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ice.check_interval_ms == 0 {
            return Err(ConfigError::Message("ice.check_interval_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    Controlling,
    #[default]
    Controlled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Addresses advertised as host candidates. Empty means the address of
    /// the default route.
    pub host_addresses: Vec<IpAddr>,
    /// 0 lets the OS pick a port
    pub port_min: u16,
    pub port_max: u16,
    pub role: IceRole,
    pub check_interval_ms: u64,
    pub max_check_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnected_timeout_ms: u64,
    pub failed_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            host_addresses: Vec::new(),
            port_min: 0,
            port_max: 0,
            role: IceRole::Controlled,
            check_interval_ms: 50,
            max_check_interval_ms: 1_600,
            keepalive_interval_ms: 2_500,
            connect_timeout_ms: 30_000,
            disconnected_timeout_ms: 5_000,
            failed_timeout_ms: 25_000,
        }
    }
}

impl IceConfig {
    /// Never zero, also for configs built in code
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn max_check_interval(&self) -> Duration {
        Duration::from_millis(self.max_check_interval_ms.max(self.check_interval_ms).max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnected_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_timeout_ms)
    }

    pub fn failed_timeout(&self) -> Duration {
        Duration::from_millis(self.failed_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtlsConfig {
    pub handshake_timeout_ms: u64,
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
        }
    }
}

impl DtlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 0 means one worker per available core
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl PoolConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        num_cpus::get()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub cpu: PoolConfig,
    pub io: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            cpu: PoolConfig::default(),
            io: PoolConfig {
                workers: 2,
                queue_capacity: 512,
                overflow: OverflowPolicy::DropOldest,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Packets buffered between a publisher and its router
    pub feed_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            feed_queue_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub jitter_capacity: usize,
    pub jitter_max_delay_ms: u64,
    /// Packets buffered between a router and an outbound transport
    pub outbound_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jitter_capacity: 64,
            jitter_max_delay_ms: 100,
            outbound_queue_capacity: 512,
        }
    }
}

impl PipelineConfig {
    pub fn jitter(&self) -> fanout_media::JitterConfig {
        fanout_media::JitterConfig {
            capacity: self.jitter_capacity,
            max_delay: Duration::from_millis(self.jitter_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// A demo stream started by the binary: one publisher fanned out to file sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub source: StreamSourceConfig,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamSourceConfig {
    Synthetic(SyntheticConfig),
    File {
        path: PathBuf,
        #[serde(default)]
        looping: bool,
        #[serde(default = "default_codecs")]
        codecs: Vec<CodecParameters>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub path: PathBuf,
    #[serde(default = "default_codecs")]
    pub codecs: Vec<CodecParameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub video: bool,
    pub audio: bool,
    pub video_bitrate_kbps: u32,
    pub frame_rate: u32,
    pub width: u16,
    pub height: u16,
    pub keyframe_interval_ms: u64,
    pub codecs: Vec<CodecParameters>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            video_bitrate_kbps: 500,
            frame_rate: 30,
            width: 640,
            height: 480,
            keyframe_interval_ms: 2_000,
            codecs: default_codecs(),
        }
    }
}

pub fn default_codecs() -> Vec<CodecParameters> {
    vec![
        CodecParameters::new(Codec::Opus, Codec::Opus.default_payload_type()),
        CodecParameters::new(Codec::Vp8, Codec::Vp8.default_payload_type()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> Environment {
        RelayConfig::environment().source(Some(Default::default()))
    }

    #[test]
    fn defaults_without_sources() {
        let config = RelayConfig::load_from(None, no_env()).unwrap();
        assert_eq!(config.ice.role, IceRole::Controlled);
        assert_eq!(config.pools.cpu.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.dtls.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Plain);
        assert!(config.streams.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanout.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_format = "json"

[ice]
host_addresses = ["127.0.0.1"]
port_min = 40000
port_max = 40100
role = "controlling"

[pools.cpu]
workers = 3
overflow = "block"

[[streams]]
name = "demo"
source = {{ type = "synthetic", frame_rate = 15 }}
sinks = [{{ path = "/tmp/out.rtpdump" }}]
"#
        )
        .unwrap();

        let config = RelayConfig::load_from(Some(path.as_path()), no_env()).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.ice.host_addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.ice.port_min, 40000);
        assert_eq!(config.ice.role, IceRole::Controlling);
        assert_eq!(config.ice.keepalive_interval_ms, 2_500);
        assert_eq!(config.pools.cpu.worker_count(), 3);
        assert_eq!(config.pools.cpu.overflow, OverflowPolicy::Block);

        let stream = &config.streams[0];
        assert_eq!(stream.name, "demo");
        let StreamSourceConfig::Synthetic(synthetic) = &stream.source else {
            panic!("expected a synthetic source");
        };
        assert_eq!(synthetic.frame_rate, 15);
        assert!(synthetic.video);
        assert_eq!(stream.sinks[0].codecs, default_codecs());
    }

    #[test]
    fn environment_overrides_file() {
        let env = RelayConfig::environment().source(Some(
            [
                ("FANOUT__ICE__PORT_MIN".to_string(), "41000".to_string()),
                ("FANOUT__DTLS__HANDSHAKE_TIMEOUT_MS".to_string(), "500".to_string()),
            ]
            .into_iter()
            .collect(),
        ));
        let config = RelayConfig::load_from(None, env).unwrap();
        assert_eq!(config.ice.port_min, 41000);
        assert_eq!(config.dtls.handshake_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn zero_check_interval_is_rejected() {
        let env = RelayConfig::environment().source(Some(
            [("FANOUT__ICE__CHECK_INTERVAL_MS".to_string(), "0".to_string())]
                .into_iter()
                .collect(),
        ));
        let err = RelayConfig::load_from(None, env).unwrap_err();
        assert!(err.to_string().contains("check_interval_ms"));

        let in_code = IceConfig {
            check_interval_ms: 0,
            ..IceConfig::default()
        };
        assert_eq!(in_code.check_interval(), Duration::from_millis(1));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from(Some(dir.path().join("absent.toml").as_path()), no_env()).unwrap();
        assert_eq!(config.router.feed_queue_capacity, 512);
    }
}
