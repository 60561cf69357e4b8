use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use serde_derive::Deserialize;

/// Publishes whether a PipeWire capture node is running to MQTT and toggles
/// GNOME's notification banners to match.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Cli {
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: String,

    #[arg(long, env = "MQTT_PORT")]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: String,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: String,

    #[arg(long, env = "MQTT_TOPIC")]
    pub mqtt_topic: String,

    /// PipeWire `node.name` of the capture device to watch.
    #[arg(long, env = "PW_NODE_NAME")]
    pub pw_node_name: String,

    /// Optional TOML file with tuning knobs.
    #[arg(long, env = "PRESENCE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Optional settings file. Every field has a default.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct TuningFile {
    pub mqtt: Option<MqttTuning>,
    pub poll: Option<PollTuning>,
    pub pipewire: Option<PipewireTuning>,
    pub desktop: Option<DesktopTuning>,
    pub shutdown: Option<ShutdownTuning>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct MqttTuning {
    pub client_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PollTuning {
    pub interval_ms: Option<u64>,
    pub cache_device_id: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PipewireTuning {
    pub binary: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DesktopTuning {
    pub enabled: Option<bool>,
    pub binary: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ShutdownTuning {
    pub disconnect_grace_ms: Option<u64>,
    pub force_exit_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub node_name: String,
    pub poll_interval: Duration,
    pub pipewire: PipewireConfig,
    pub desktop: DesktopConfig,
    pub disconnect_grace: Duration,
    pub force_exit_after: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipewireConfig {
    pub binary: String,
    pub cache_device_id: bool,
}

#[derive(Debug, Clone)]
pub struct DesktopConfig {
    pub enabled: bool,
    pub binary: String,
}

impl TuningFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl AppConfig {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let tuning = match &cli.config {
            Some(path) => TuningFile::load(path)?,
            None => TuningFile::default(),
        };
        Ok(Self::from_parts(cli, tuning))
    }

    pub fn from_parts(cli: Cli, tuning: TuningFile) -> Self {
        let mqtt = tuning.mqtt.unwrap_or_default();
        let poll = tuning.poll.unwrap_or_default();
        let pipewire = tuning.pipewire.unwrap_or_default();
        let desktop = tuning.desktop.unwrap_or_default();
        let shutdown = tuning.shutdown.unwrap_or_default();

        AppConfig {
            mqtt: MqttConfig {
                host: cli.mqtt_host,
                port: cli.mqtt_port,
                username: cli.mqtt_user,
                password: cli.mqtt_password,
                topic: cli.mqtt_topic,
                client_id: mqtt.client_id.unwrap_or_else(|| "meeting-presence".to_string()),
                keep_alive: Duration::from_secs(mqtt.keep_alive_seconds.unwrap_or(5)),
                connect_timeout: Duration::from_millis(mqtt.connect_timeout_ms.unwrap_or(10_000)),
                ack_timeout: Duration::from_millis(mqtt.ack_timeout_ms.unwrap_or(5_000)),
            },
            node_name: cli.pw_node_name,
            poll_interval: Duration::from_millis(poll.interval_ms.unwrap_or(1_000).max(1)),
            pipewire: PipewireConfig {
                binary: pipewire.binary.unwrap_or_else(|| "pw-cli".to_string()),
                cache_device_id: poll.cache_device_id.unwrap_or(false),
            },
            desktop: DesktopConfig {
                enabled: desktop.enabled.unwrap_or(true),
                binary: desktop.binary.unwrap_or_else(|| "gsettings".to_string()),
            },
            disconnect_grace: Duration::from_millis(shutdown.disconnect_grace_ms.unwrap_or(250)),
            force_exit_after: Duration::from_millis(shutdown.force_exit_ms.unwrap_or(500)),
        }
    }
}
