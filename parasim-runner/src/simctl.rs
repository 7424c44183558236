// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface to Apple's `xcrun simctl` device-control tool.
//!
//! Simulators are provisioned once per lane before the run starts, wiped
//! (not recreated) between warm retries, and shut down and deleted at run
//! end or on cancellation. Parasim-owned devices are identified by a name
//! prefix so stale instances from crashed runs can be cleaned up.

use crate::errors::{DeviceSpecParseError, SimctlError};
use serde::Deserialize;
use std::{collections::HashMap, fmt, process::Stdio, str::FromStr};
use tokio::process::Command;
use tracing::{debug, warn};

/// Name prefix for simulator devices owned by parasim.
const DEVICE_PREFIX: &str = "Parasim";

/// One entry of the device matrix: a device type plus an OS version, e.g.
/// `iPhone 8, iOS 12.4`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DeviceSpec {
    /// Device type name as shown by `simctl list devicetypes`.
    pub device_type: String,
    /// Runtime name as shown by `simctl list runtimes`, e.g. `iOS 12.4`.
    pub os_version: String,
}

impl DeviceSpec {
    /// The bare version number of the runtime, e.g. `12.4` for `iOS 12.4`.
    pub fn os_number(&self) -> &str {
        self.os_version
            .strip_prefix("iOS ")
            .unwrap_or(&self.os_version)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.device_type, self.os_version)
    }
}

impl FromStr for DeviceSpec {
    type Err = DeviceSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ',');
        let device_type = parts.next().unwrap_or_default().trim();
        let os_version = parts.next().unwrap_or_default().trim();
        if device_type.is_empty() || os_version.is_empty() {
            return Err(DeviceSpecParseError::new(s));
        }
        Ok(Self {
            device_type: device_type.to_owned(),
            os_version: os_version.to_owned(),
        })
    }
}

/// Parses a `;`-separated device matrix, e.g.
/// `"iPhone 8, iOS 12.4; iPad Air 2, iOS 12.4"`.
pub fn parse_device_matrix(s: &str) -> Result<Vec<DeviceSpec>, DeviceSpecParseError> {
    s.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(DeviceSpec::from_str)
        .collect()
}

/// One OS-level simulator instance, exclusively owned by its lane for the
/// duration of a run.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Simulator {
    /// Device name, carrying the stable lane number, device type, and OS
    /// version.
    pub name: String,
    /// The simctl-assigned device identifier.
    pub udid: String,
}

#[derive(Debug, Deserialize)]
struct NamedIdentifier {
    name: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    name: String,
    udid: String,
}

/// Deserialized subset of `simctl list -j` output.
#[derive(Debug, Deserialize)]
struct SimctlList {
    #[serde(default)]
    devicetypes: Vec<NamedIdentifier>,
    #[serde(default)]
    runtimes: Vec<NamedIdentifier>,
    #[serde(default)]
    devices: HashMap<String, Vec<DeviceEntry>>,
}

/// Wrapper for `xcrun simctl` commands.
#[derive(Debug, Default)]
pub struct SimctlClient;

impl SimctlClient {
    /// Creates a new client.
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, SimctlError> {
        let rendered = render_command(args);
        debug!(command = %rendered, "running simctl");
        let output = Command::new("xcrun")
            .arg("simctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| SimctlError::Exec {
                command: rendered.clone(),
                error,
            })?;
        if !output.status.success() {
            return Err(SimctlError::CommandFailed {
                command: rendered,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    async fn list(&self) -> Result<SimctlList, SimctlError> {
        let output = self.run(&["list", "-j"]).await?;
        serde_json::from_slice(&output.stdout).map_err(SimctlError::ListParse)
    }

    /// Creates `per_spec` simulators for each entry of the device matrix,
    /// numbered consecutively across the whole matrix. Returns one group of
    /// simulators per device spec, in matrix order.
    pub async fn create_devices(
        &self,
        specs: &[DeviceSpec],
        per_spec: usize,
    ) -> Result<Vec<Vec<Simulator>>, SimctlError> {
        let list = self.list().await?;
        let device_types: HashMap<&str, &str> = list
            .devicetypes
            .iter()
            .map(|entry| (entry.name.as_str(), entry.identifier.as_str()))
            .collect();
        let runtimes: HashMap<&str, &str> = list
            .runtimes
            .iter()
            .map(|entry| (entry.name.as_str(), entry.identifier.as_str()))
            .collect();

        let mut groups = Vec::with_capacity(specs.len());
        let mut device_number = 1;
        for spec in specs {
            let device_type_id = *device_types.get(spec.device_type.as_str()).ok_or_else(|| {
                SimctlError::UnknownDeviceType {
                    name: spec.device_type.clone(),
                }
            })?;
            let runtime_id = *runtimes.get(spec.os_version.as_str()).ok_or_else(|| {
                SimctlError::UnknownRuntime {
                    name: spec.os_version.clone(),
                }
            })?;

            let mut simulators = Vec::with_capacity(per_spec);
            for _ in 0..per_spec {
                let name = format!("{DEVICE_PREFIX} {device_number}, {spec}");
                let output = self
                    .run(&["create", &name, device_type_id, runtime_id])
                    .await?;
                let udid = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                simulators.push(Simulator { name, udid });
                device_number += 1;
            }
            groups.push(simulators);
        }
        Ok(groups)
    }

    /// Wipes a simulator for a warm retry: kills stray processes bound to
    /// the device and erases app data, without recreating the device.
    pub async fn reuse(&self, simulator: &Simulator) -> Result<(), SimctlError> {
        self.kill_device_processes(&simulator.udid).await?;
        // Shutdown fails when the device is already shut down.
        let _ = self.run(&["shutdown", &simulator.udid]).await;
        self.run(&["erase", &simulator.udid]).await?;
        Ok(())
    }

    /// Shuts down and deletes a simulator.
    pub async fn destroy(&self, simulator: &Simulator) -> Result<(), SimctlError> {
        self.kill_device_processes(&simulator.udid).await?;
        let _ = self.run(&["shutdown", &simulator.udid]).await;
        self.run(&["delete", &simulator.udid]).await?;
        Ok(())
    }

    /// Deletes all parasim-owned devices left over from earlier runs.
    pub async fn delete_stale_devices(&self) -> Result<(), SimctlError> {
        let list = self.list().await?;
        for entry in list.devices.into_values().flatten() {
            if entry.name.starts_with(DEVICE_PREFIX) {
                debug!(name = %entry.name, udid = %entry.udid, "deleting stale device");
                let simulator = Simulator {
                    name: entry.name,
                    udid: entry.udid,
                };
                if let Err(error) = self.destroy(&simulator).await {
                    warn!(%error, "failed to delete stale device");
                }
            }
        }
        Ok(())
    }

    /// Best-effort kill of OS processes associated with a device.
    async fn kill_device_processes(&self, udid: &str) -> Result<(), SimctlError> {
        let rendered = format!("pkill -9 -f {udid}");
        // pkill exits 1 when nothing matched; only spawn failures matter.
        Command::new("pkill")
            .args(["-9", "-f", udid])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|error| SimctlError::Exec {
                command: rendered,
                error,
            })?;
        Ok(())
    }
}

fn render_command(args: &[&str]) -> String {
    let mut words = vec!["xcrun", "simctl"];
    words.extend_from_slice(args);
    shell_words::join(words)
}
