use std::cell::Cell;
use std::sync::LazyLock;

use log::{debug, error, info, warn};
use regex::Regex;
use thiserror::Error;

use crate::command::{CommandError, CommandRunner};
use crate::config::PipewireConfig;
use crate::messages::{DeviceId, DeviceStatus};

const RUNNING_STATE: &str = "running";

/// Lines above the matching `node.name` line that may still belong to the
/// same `pw-cli ls` record.
const HEADER_SEARCH_LINES: usize = 10;

static DEVICE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bid ([0-9]+)").expect("valid device id regex"));
static STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"state: "?([a-z]+)"#).expect("valid state regex"));

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("node {0:?} not found in pw-cli output")]
    NotFound(String),

    #[error("no device id near node {0:?} in pw-cli output")]
    MissingId(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no state for device {0} in pw-cli output")]
    MissingState(DeviceId),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Finds the id of `node_name` in `pw-cli ls` output.
///
/// Only the first line mentioning the name is considered, together with up
/// to [`HEADER_SEARCH_LINES`] lines above it. The id closest to the name wins,
/// so a short record sitting just above ours can't lend us its id.
pub fn find_device_id(listing: &str, node_name: &str) -> Result<DeviceId, ResolveError> {
    let lines: Vec<&str> = listing.lines().collect();
    let Some(index) = lines.iter().position(|line| line.contains(node_name)) else {
        return Err(ResolveError::NotFound(node_name.to_string()));
    };
    let start = index.saturating_sub(HEADER_SEARCH_LINES);

    lines[start..=index]
        .iter()
        .rev()
        .find_map(|line| DEVICE_ID_RE.captures_iter(line).last())
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .map(DeviceId)
        .ok_or_else(|| ResolveError::MissingId(node_name.to_string()))
}

/// Pulls the node state word out of `pw-cli i <id>` output.
pub fn parse_state(info: &str) -> Option<&str> {
    STATE_RE
        .captures(info)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub struct PipeWire<R> {
    runner: R,
    binary: String,
    cache_enabled: bool,
    cached: Cell<Option<DeviceId>>,
}

impl<R: CommandRunner> PipeWire<R> {
    pub fn new(runner: R, config: &PipewireConfig) -> Self {
        PipeWire {
            runner,
            binary: config.binary.clone(),
            cache_enabled: config.cache_device_id,
            cached: Cell::new(None),
        }
    }

    pub async fn resolve(&self, node_name: &str) -> Result<DeviceId, ResolveError> {
        debug!("Looking up PipeWire node {:?}", node_name);
        let listing = self.runner.run(&self.binary, &["ls"]).await?;
        let id = find_device_id(&listing, node_name)?;
        debug!("Resolved node {:?} to device {}", node_name, id);
        Ok(id)
    }

    /// Like [`PipeWire::probe`], but reports why the state couldn't be read.
    pub async fn probe_checked(&self, id: DeviceId) -> Result<DeviceStatus, ProbeError> {
        let id_arg = id.to_string();
        let info = self.runner.run(&self.binary, &["i", &id_arg]).await?;
        let state = parse_state(&info).ok_or(ProbeError::MissingState(id))?;

        let status = if state == RUNNING_STATE {
            DeviceStatus::Active
        } else {
            DeviceStatus::Inactive
        };
        debug!("Device {} is {:?} (state: {})", id, status, state);
        Ok(status)
    }

    /// Reads the device state, falling back to `Inactive` on any failure.
    /// A broken audio stack must look like "no meeting", never an error.
    pub async fn probe(&self, id: DeviceId) -> DeviceStatus {
        match self.probe_checked(id).await {
            Ok(status) => status,
            Err(err) => {
                error!("Error checking status of device {}: {}", id, err);
                DeviceStatus::Inactive
            }
        }
    }

    /// Resolves `node_name` and probes it. Returns `Err` only when the node
    /// could not be resolved; probe failures read as `Inactive`.
    ///
    /// With the id cache on, the last id is reused until a probe against it
    /// fails, after which the node is resolved again within the same call.
    pub async fn status_of(&self, node_name: &str) -> Result<DeviceStatus, ResolveError> {
        if self.cache_enabled {
            if let Some(id) = self.cached.get() {
                match self.probe_checked(id).await {
                    Ok(status) => return Ok(status),
                    Err(err) => {
                        warn!("Cached device {} for node {:?} failed: {}", id, node_name, err);
                        self.cached.set(None);
                    }
                }
            }
        }

        let id = self.resolve(node_name).await?;
        if self.cache_enabled {
            info!("Caching device {} for node {:?}", id, node_name);
            self.cached.set(Some(id));
            return match self.probe_checked(id).await {
                Ok(status) => Ok(status),
                Err(err) => {
                    error!("Error checking status of device {}: {}", id, err);
                    self.cached.set(None);
                    Ok(DeviceStatus::Inactive)
                }
            };
        }
        Ok(self.probe(id).await)
    }
}
