// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use multipath_contracts::{EngineError, TableEngine};
use multipath_types::{
    DevT, MPATH_UUID_PREFIX, MULTIPATH_TARGET, MapInfo, MapName, MapStatus, MapTable, PathAction,
    WaitOutcome,
};
use tracing::{debug, trace};

use super::table::{
    INFO_COLUMNS, parse_info_line, parse_ls, parse_status, parse_table, render_table, table_target,
};
use crate::{Result, SysError};

const WAIT_POLL_STEP: Duration = Duration::from_millis(100);

fn classify_failure(command: &str, stderr: &str) -> SysError {
    let lower = stderr.to_lowercase();
    if lower.contains("busy") {
        SysError::Busy(format!("{command}: {}", stderr.trim()))
    } else if lower.contains("no such device")
        || lower.contains("does not exist")
        || lower.contains("not found")
    {
        SysError::DeviceNotFound(format!("{command}: {}", stderr.trim()))
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        SysError::PermissionDenied(format!("{command}: {}", stderr.trim()))
    } else {
        SysError::OperationFailed(format!("{command} failed: {}", stderr.trim()))
    }
}

/// Table engine backed by the `dmsetup` utility.
pub struct DmsetupEngine {
    binary: PathBuf,
}

impl DmsetupEngine {
    /// Locate `dmsetup` on `PATH`.
    pub fn new() -> Result<Self> {
        let binary = which::which("dmsetup")
            .map_err(|e| SysError::OperationFailed(format!("dmsetup not available: {}", e)))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        trace!("dmsetup {}", args.join(" "));
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let command = format!("dmsetup {}", args.first().copied().unwrap_or_default());
            return Err(classify_failure(&command, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn message(&self, name: &str, message: &str) -> Result<()> {
        debug!("{}: message '{}'", name, message);
        self.run(&["message", name, "0", message])?;
        Ok(())
    }

    fn info_line(&self, name: Option<&str>) -> Result<String> {
        let mut args = vec![
            "info",
            "-c",
            "--noheadings",
            "--separator",
            ";",
            "-o",
            INFO_COLUMNS,
        ];
        if let Some(name) = name {
            args.push(name);
        }
        self.run(&args)
    }
}

impl TableEngine for DmsetupEngine {
    fn create(&self, name: &str, table: &MapTable) -> std::result::Result<(), EngineError> {
        let uuid = format!("{MPATH_UUID_PREFIX}{}", table.wwid);
        let rendered = render_table(table);
        debug!("{}: create '{}'", name, rendered);
        self.run(&["create", name, "--uuid", &uuid, "--table", &rendered])?;
        Ok(())
    }

    fn reload(&self, name: &str, table: &MapTable) -> std::result::Result<(), EngineError> {
        let rendered = render_table(table);
        debug!("{}: reload '{}'", name, rendered);
        self.run(&["reload", name, "--table", &rendered])?;
        self.run(&["resume", name])?;
        Ok(())
    }

    fn suspend(&self, name: &str) -> std::result::Result<(), EngineError> {
        self.run(&["suspend", name])?;
        Ok(())
    }

    fn resume(&self, name: &str) -> std::result::Result<(), EngineError> {
        self.run(&["resume", name])?;
        Ok(())
    }

    fn remove(&self, name: &str, no_flush: bool) -> std::result::Result<(), EngineError> {
        if no_flush {
            self.run(&["suspend", "--noflush", name])?;
        }
        match self.run(&["remove", name]) {
            Ok(_) => Ok(()),
            Err(err) => {
                if no_flush {
                    // leave the device usable if it stays around
                    let _ = self.run(&["resume", name]);
                }
                Err(err.into())
            }
        }
    }

    fn get_info(&self, name: &str) -> std::result::Result<MapInfo, EngineError> {
        let output = match self.info_line(Some(name)) {
            Ok(output) => output,
            Err(SysError::DeviceNotFound(_)) => {
                return Ok(MapInfo {
                    name: name.to_string(),
                    exists: false,
                    ..MapInfo::default()
                });
            }
            Err(err) => return Err(err.into()),
        };

        let line = output
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| SysError::Parse(format!("empty info output for {name}")))?;
        let mut info = parse_info_line(line)?;
        info.target = table_target(&self.run(&["table", name])?);
        Ok(info)
    }

    fn status(&self, name: &str) -> std::result::Result<MapStatus, EngineError> {
        let output = self.run(&["status", name])?;
        let line = output.lines().next().unwrap_or_default();
        Ok(parse_status(line)?)
    }

    fn table(&self, name: &str) -> std::result::Result<MapTable, EngineError> {
        let output = self.run(&["table", name])?;
        let line = output.lines().next().unwrap_or_default();
        Ok(parse_table(line)?)
    }

    fn list_names(&self) -> std::result::Result<Vec<MapName>, EngineError> {
        let names = parse_ls(&self.run(&["ls", "--target", MULTIPATH_TARGET])?);
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let counters: HashMap<String, u32> = self
            .info_line(None)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| parse_info_line(line).ok())
            .map(|info| (info.name, info.event_nr))
            .collect();

        Ok(names
            .into_iter()
            .filter_map(|name| {
                let event_nr = *counters.get(&name)?;
                Some(MapName { name, event_nr })
            })
            .collect())
    }

    fn get_event_counter(&self, name: &str) -> std::result::Result<u32, EngineError> {
        let info = self.get_info(name)?;
        if !info.exists {
            return Err(EngineError::not_found(format!("{name} does not exist")));
        }
        Ok(info.event_nr)
    }

    fn switch_group(&self, name: &str, group: usize) -> std::result::Result<(), EngineError> {
        self.message(name, &format!("switch_group {}", group + 1))?;
        Ok(())
    }

    fn mark_path(
        &self,
        name: &str,
        devt: DevT,
        action: PathAction,
    ) -> std::result::Result<(), EngineError> {
        self.message(name, &format!("{} {}", action.message(), devt))?;
        Ok(())
    }

    fn set_queueing(&self, name: &str, queue: bool) -> std::result::Result<(), EngineError> {
        let message = if queue {
            "queue_if_no_path"
        } else {
            "fail_if_no_path"
        };
        self.message(name, message)?;
        Ok(())
    }

    fn wait_event(
        &self,
        name: &str,
        event_nr: u32,
        timeout: Duration,
    ) -> std::result::Result<WaitOutcome, EngineError> {
        let mut child = Command::new(&self.binary)
            .args(["wait", name, &event_nr.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SysError::from)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(SysError::from)? {
                if status.success() {
                    return match self.get_info(name)? {
                        info if info.exists => Ok(WaitOutcome::Changed(info.event_nr)),
                        _ => Ok(WaitOutcome::Gone),
                    };
                }
                if !self.get_info(name)?.exists {
                    return Ok(WaitOutcome::Gone);
                }
                return Err(SysError::OperationFailed(format!(
                    "dmsetup wait {name} exited with {status}"
                ))
                .into());
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(WAIT_POLL_STEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_dmsetup_failures() {
        assert!(matches!(
            classify_failure("dmsetup remove", "device-mapper: remove ioctl on mpatha failed: Device or resource busy"),
            SysError::Busy(_)
        ));
        assert!(matches!(
            classify_failure("dmsetup info", "Device mpathz not found"),
            SysError::DeviceNotFound(_)
        ));
        assert!(matches!(
            classify_failure("dmsetup create", "Operation not permitted"),
            SysError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_failure("dmsetup reload", "Invalid argument"),
            SysError::OperationFailed(_)
        ));
    }

    #[test]
    fn busy_maps_to_busy_engine_error() {
        let err: EngineError = SysError::Busy("mpatha".to_string()).into();
        assert!(err.is_busy());
    }
}
