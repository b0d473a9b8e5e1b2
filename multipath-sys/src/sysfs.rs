// SPDX-License-Identifier: GPL-3.0-only

//! Path discovery and health probing through sysfs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use multipath_contracts::{DeviceDiscovery, EngineError, PathProber};
use multipath_types::{DevT, PathIdentity, PathState};
use tracing::debug;

use crate::{Result, SysError};

const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Priority reported for paths without ALUA information.
pub const DEFAULT_PRIORITY: i32 = 1;

fn read_attr(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn read_optional_attr(path: &Path) -> Option<String> {
    read_attr(path).ok().filter(|value| !value.is_empty())
}

/// Normalize a sysfs `wwid` attribute to the designator form used as map identity.
///
/// `naa.` designators become `3…`, `eui.` become `2…`, `t10.` become `1…`.
pub fn normalize_wwid(raw: &str) -> String {
    let raw = raw.trim();
    let (prefix, rest) = match raw.split_once('.') {
        Some(("naa", rest)) => ("3", rest),
        Some(("eui", rest)) => ("2", rest),
        Some(("t10", rest)) => ("1", rest),
        _ => return raw.to_string(),
    };
    format!("{prefix}{}", rest.to_lowercase())
}

/// Block device discovery rooted at a sysfs mount.
#[derive(Debug, Clone)]
pub struct SysfsDiscovery {
    root: PathBuf,
}

impl Default for SysfsDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn block_dir(&self, dev: &str) -> PathBuf {
        self.root.join("block").join(dev)
    }

    fn read_identity(&self, dev: &str) -> Result<PathIdentity> {
        let dir = self.block_dir(dev);
        if !dir.exists() {
            return Err(SysError::DeviceNotFound(dev.to_string()));
        }

        let devt: DevT = read_attr(&dir.join("dev"))?
            .parse()
            .map_err(SysError::Parse)?;
        let size: u64 = read_attr(&dir.join("size"))?
            .parse()
            .map_err(|_| SysError::Parse(format!("invalid size for {dev}")))?;
        let wwid = read_optional_attr(&dir.join("device").join("wwid"))
            .or_else(|| read_optional_attr(&dir.join("wwid")))
            .map(|raw| normalize_wwid(&raw))
            .unwrap_or_default();

        Ok(PathIdentity {
            dev: dev.to_string(),
            devt,
            wwid,
            size,
        })
    }
}

impl DeviceDiscovery for SysfsDiscovery {
    fn scan(&self) -> std::result::Result<Vec<String>, EngineError> {
        let mut names: Vec<String> = fs::read_dir(self.root.join("block"))
            .map_err(SysError::from)?
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn identify(&self, dev: &str) -> std::result::Result<PathIdentity, EngineError> {
        Ok(self.read_identity(dev)?)
    }

    fn resolve_devt(&self, devt: DevT) -> std::result::Result<String, EngineError> {
        let link = self.root.join("dev").join("block").join(devt.to_string());
        let target = fs::read_link(&link).map_err(SysError::from)?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| EngineError::not_found(format!("no block device for {devt}")))
    }

    fn select_prober(&self, path: &PathIdentity) -> Box<dyn PathProber> {
        debug!("{}: using sysfs state checker", path.dev);
        Box::new(SysfsStateProber::new(self.root.clone()))
    }
}

/// Checker reading the SCSI device state and ALUA access state from sysfs.
#[derive(Debug)]
pub struct SysfsStateProber {
    root: PathBuf,
    message: Option<String>,
}

impl SysfsStateProber {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            message: None,
        }
    }

    fn device_dir(&self, path: &PathIdentity) -> PathBuf {
        self.root.join("block").join(&path.dev).join("device")
    }

    fn state_from_attrs(device_state: Option<&str>, access_state: Option<&str>) -> (PathState, Option<String>) {
        let state = match device_state {
            None => return (PathState::Unchecked, Some("no device state".to_string())),
            Some("running") => PathState::Up,
            Some("offline") | Some("transport-offline") => {
                return (PathState::Down, Some("path offline".to_string()));
            }
            Some("blocked") | Some("quiesce") | Some("created") => {
                return (PathState::Pending, None);
            }
            Some(other) => {
                return (PathState::Wild, Some(format!("unknown device state '{other}'")));
            }
        };

        match access_state {
            Some("standby") => (PathState::Ghost, Some("path is in standby".to_string())),
            Some("unavailable") | Some("offline") => {
                (PathState::Down, Some("path unavailable".to_string()))
            }
            Some("transitioning") => (PathState::Pending, None),
            _ => (state, None),
        }
    }
}

impl PathProber for SysfsStateProber {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn offline_test(&mut self, path: &PathIdentity) -> bool {
        !self.root.join("block").join(&path.dev).exists()
    }

    fn probe(&mut self, path: &PathIdentity, _timeout: Duration) -> PathState {
        // sysfs attribute reads do not block on the device
        let dir = self.device_dir(path);
        let device_state = read_optional_attr(&dir.join("state"));
        let access_state = read_optional_attr(&dir.join("access_state"));
        let (state, message) =
            Self::state_from_attrs(device_state.as_deref(), access_state.as_deref());
        self.message = message;
        state
    }

    fn priority(&mut self, path: &PathIdentity) -> i32 {
        match read_optional_attr(&self.device_dir(path).join("access_state")).as_deref() {
            Some("active/optimized") => 50,
            Some("active/non-optimized") => 10,
            Some("standby") => 1,
            Some("unavailable") | Some("offline") => 0,
            _ => DEFAULT_PRIORITY,
        }
    }

    fn message(&self) -> Option<String> {
        self.message.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "multipath-sys-sysfs-{}-{unique}",
                std::process::id()
            ));
            fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }

        fn add_disk(&self, dev: &str, devt: &str, size: u64, wwid: Option<&str>) -> PathBuf {
            let dir = self.path.join("block").join(dev);
            fs::create_dir_all(dir.join("device")).expect("create device dir");
            fs::write(dir.join("dev"), format!("{devt}\n")).expect("write dev");
            fs::write(dir.join("size"), format!("{size}\n")).expect("write size");
            if let Some(wwid) = wwid {
                fs::write(dir.join("device").join("wwid"), format!("{wwid}\n"))
                    .expect("write wwid");
            }
            dir
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn normalizes_designators() {
        assert_eq!(normalize_wwid("naa.600A0980383030"), "3600a0980383030");
        assert_eq!(normalize_wwid("eui.0025385b71b07e2f"), "20025385b71b07e2f");
        assert_eq!(normalize_wwid("36001405abcdef"), "36001405abcdef");
    }

    #[test]
    fn identifies_disk_from_sysfs() {
        let tmp = TempDir::new();
        tmp.add_disk("sdb", "8:16", 2097152, Some("naa.600a0980383030"));
        tmp.add_disk("sdc", "8:32", 2097152, None);

        let discovery = SysfsDiscovery::new(&tmp.path);
        let identity = discovery.identify("sdb").expect("identify sdb");
        assert_eq!(identity.devt, DevT::new(8, 16));
        assert_eq!(identity.size, 2097152);
        assert_eq!(identity.wwid, "3600a0980383030");

        let unnamed = discovery.identify("sdc").expect("identify sdc");
        assert!(!unnamed.is_identified());

        let missing = discovery.identify("sdz").expect_err("sdz is missing");
        assert!(missing.is_not_found());

        assert_eq!(
            discovery.scan().expect("scan"),
            vec!["sdb".to_string(), "sdc".to_string()]
        );
    }

    #[test]
    fn probes_device_and_access_state() {
        let tmp = TempDir::new();
        let dir = tmp.add_disk("sdb", "8:16", 2048, Some("naa.600a"));
        let identity = SysfsDiscovery::new(&tmp.path).identify("sdb").expect("identify");
        let mut prober = SysfsStateProber::new(&tmp.path);
        let timeout = Duration::from_secs(1);

        assert_eq!(prober.probe(&identity, timeout), PathState::Unchecked);

        fs::write(dir.join("device").join("state"), "running\n").expect("write state");
        assert_eq!(prober.probe(&identity, timeout), PathState::Up);
        assert_eq!(prober.priority(&identity), DEFAULT_PRIORITY);

        fs::write(dir.join("device").join("access_state"), "standby\n").expect("write alua");
        assert_eq!(prober.probe(&identity, timeout), PathState::Ghost);
        assert_eq!(prober.priority(&identity), 1);

        fs::write(dir.join("device").join("state"), "offline\n").expect("write state");
        assert_eq!(prober.probe(&identity, timeout), PathState::Down);
        assert_eq!(prober.message().as_deref(), Some("path offline"));

        assert!(!prober.offline_test(&identity));
        fs::remove_dir_all(&dir).expect("remove disk");
        assert!(prober.offline_test(&identity));
    }
}
