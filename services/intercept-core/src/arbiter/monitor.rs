//! WiFi monitor-mode switching
//!
//! Entering monitor mode may rename the interface (`wlan0` -> `wlan0mon`), so
//! both directions return the name that is authoritative afterwards.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ToolCommand;

const AIRMON_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", AIRMON_TIMEOUT.as_secs())]
    Timeout { program: String },

    #[error("{program} failed ({status}): {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },

    #[error("{0} does not support monitor mode")]
    Unsupported(String),
}

/// Enables/disables monitor mode on a wireless interface
#[async_trait]
pub trait MonitorControl: Send + Sync {
    /// Returns the interface name to capture on
    async fn enable(&self, iface: &str) -> Result<String, MonitorError>;

    /// Returns the managed-mode interface name
    async fn disable(&self, iface: &str) -> Result<String, MonitorError>;
}

/// `airmon-ng start|stop <iface>`
pub struct AirmonNg {
    tool: ToolCommand,
    sysfs_root: PathBuf,
}

impl AirmonNg {
    pub fn new(tool: ToolCommand, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            sysfs_root: sysfs_root.into(),
        }
    }

    async fn run(&self, verb: &str, iface: &str) -> Result<String, MonitorError> {
        let program = self.tool.program.clone();
        let mut cmd = Command::new(&program);
        cmd.args(&self.tool.leading_args)
            .arg(verb)
            .arg(iface)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} {} {}", program, verb, iface);
        let output = match tokio::time::timeout(AIRMON_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(MonitorError::Spawn { program, source }),
            Err(_) => return Err(MonitorError::Timeout { program }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MonitorError::Failed {
                program,
                status: output.status.to_string(),
                output: format!("{}{}", stdout.trim(), stderr.trim()),
            });
        }
        Ok(stdout)
    }

    fn iface_exists(&self, name: &str) -> bool {
        self.sysfs_root.join("class/net").join(name).exists()
    }

    /// Prefer the name the tool reported, then `<iface>mon`, then the original
    fn resolve(&self, reported: Option<String>, original: &str, suffixed: &str) -> String {
        if let Some(name) = reported.filter(|n| self.iface_exists(n)) {
            return name;
        }
        if self.iface_exists(suffixed) {
            return suffixed.to_string();
        }
        original.to_string()
    }
}

#[async_trait]
impl MonitorControl for AirmonNg {
    async fn enable(&self, iface: &str) -> Result<String, MonitorError> {
        let output = self.run("start", iface).await?;
        let reported = reported_interface(&output, "monitor mode");
        let resolved = self.resolve(reported, iface, &format!("{}mon", iface));
        if resolved != iface {
            info!("Monitor mode enabled: {} is now {}", iface, resolved);
        } else {
            info!("Monitor mode enabled on {}", iface);
        }
        Ok(resolved)
    }

    async fn disable(&self, iface: &str) -> Result<String, MonitorError> {
        let output = self.run("stop", iface).await?;
        let reported = reported_interface(&output, "station mode");
        let base = iface.strip_suffix("mon").unwrap_or(iface);
        let resolved = self.resolve(reported, base, base);
        if !self.iface_exists(&resolved) {
            warn!("Interface {} not found after leaving monitor mode", resolved);
        }
        Ok(resolved)
    }
}

/// Pull the interface out of lines like
/// `(mac80211 monitor mode vif enabled for [phy0]wlan0 on [phy0]wlan0mon)`
/// or `(monitor mode enabled on mon0)`
fn reported_interface(output: &str, marker: &str) -> Option<String> {
    output
        .lines()
        .filter(|l| l.contains(marker) && l.contains("enabled"))
        .filter_map(|l| l.rsplit_once(" on ").map(|(_, tail)| tail))
        .map(|tail| {
            let tail = tail.trim().trim_end_matches(')');
            match tail.rfind(']') {
                Some(i) => tail[i + 1..].to_string(),
                None => tail.to_string(),
            }
        })
        .find(|name| !name.is_empty() && !name.contains(char::is_whitespace))
}
