// SPDX-License-Identifier: GPL-3.0-only

//! Kernel uevent socket and message parsing.

use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use multipath_types::DevT;
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
    setsockopt, socket, sockopt,
};
use nix::sys::time::{TimeVal, TimeValLike};
use tracing::trace;

use crate::{Result, SysError};

const UEVENT_BUFFER_SIZE: usize = 16 * 1024;

/// Multicast group the kernel publishes uevents on.
const KERNEL_UEVENT_GROUP: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Other(String),
}

impl From<&str> for UeventAction {
    fn from(value: &str) -> Self {
        match value {
            "add" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            "change" => UeventAction::Change,
            other => UeventAction::Other(other.to_string()),
        }
    }
}

/// One kernel uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    pub devpath: String,
    pub subsystem: String,
    pub devname: Option<String>,
    pub devtype: Option<String>,
    pub devt: Option<DevT>,
    pub dm_name: Option<String>,
    pub dm_uuid: Option<String>,
    pub seqnum: Option<u64>,
}

impl Uevent {
    /// Parse a raw netlink payload: `action@devpath\0KEY=VALUE\0...`.
    ///
    /// Returns `None` for messages that are not kernel uevents.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(buf);
        let mut fields = text.split('\0').filter(|field| !field.is_empty());

        let header = fields.next()?;
        let (_, header_path) = header.split_once('@')?;

        let mut action = None;
        let mut devpath = header_path.to_string();
        let mut subsystem = String::new();
        let mut devname = None;
        let mut devtype = None;
        let mut major = None;
        let mut minor = None;
        let mut dm_name = None;
        let mut dm_uuid = None;
        let mut seqnum = None;

        for field in fields {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "ACTION" => action = Some(UeventAction::from(value)),
                "DEVPATH" => devpath = value.to_string(),
                "SUBSYSTEM" => subsystem = value.to_string(),
                "DEVNAME" => {
                    let name = value.rsplit('/').next().unwrap_or(value);
                    devname = Some(name.to_string());
                }
                "DEVTYPE" => devtype = Some(value.to_string()),
                "MAJOR" => major = value.parse().ok(),
                "MINOR" => minor = value.parse().ok(),
                "DM_NAME" => dm_name = Some(value.to_string()),
                "DM_UUID" => dm_uuid = Some(value.to_string()),
                "SEQNUM" => seqnum = value.parse().ok(),
                _ => {}
            }
        }

        let devt = match (major, minor) {
            (Some(major), Some(minor)) => Some(DevT::new(major, minor)),
            _ => None,
        };

        Some(Uevent {
            action: action?,
            devpath,
            subsystem,
            devname,
            devtype,
            devt,
            dm_name,
            dm_uuid,
            seqnum,
        })
    }

    /// Kernel name of the device, from `DEVNAME` or the last `DEVPATH` component.
    pub fn kernel_name(&self) -> Option<&str> {
        self.devname
            .as_deref()
            .or_else(|| self.devpath.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }

    pub fn is_block_disk(&self) -> bool {
        self.subsystem == "block" && self.devtype.as_deref().is_none_or(|kind| kind == "disk")
    }

    pub fn is_dm(&self) -> bool {
        self.kernel_name().is_some_and(|name| name.starts_with("dm-"))
    }
}

/// Netlink socket subscribed to kernel uevents.
pub struct UeventSocket {
    fd: OwnedFd,
    buffer: Vec<u8>,
}

impl UeventSocket {
    /// Open the socket. `recv` returns `Ok(None)` after `poll_timeout` without traffic.
    pub fn open(poll_timeout: Duration) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| SysError::OperationFailed(format!("uevent socket: {e}")))?;

        let timeout = TimeVal::milliseconds(poll_timeout.as_millis() as i64);
        setsockopt(&fd, sockopt::ReceiveTimeout, &timeout)
            .map_err(|e| SysError::OperationFailed(format!("uevent socket timeout: {e}")))?;

        let addr = NetlinkAddr::new(0, KERNEL_UEVENT_GROUP);
        bind(fd.as_raw_fd(), &addr).map_err(|e| match e {
            Errno::EPERM | Errno::EACCES => {
                SysError::PermissionDenied(format!("uevent socket bind: {e}"))
            }
            other => SysError::OperationFailed(format!("uevent socket bind: {other}")),
        })?;

        Ok(Self {
            fd,
            buffer: vec![0; UEVENT_BUFFER_SIZE],
        })
    }

    /// Receive the next uevent, or `None` on timeout or a foreign message.
    pub fn recv(&mut self) -> Result<Option<Uevent>> {
        match recv(self.fd.as_raw_fd(), &mut self.buffer, MsgFlags::empty()) {
            Ok(len) => {
                let event = Uevent::parse(&self.buffer[..len]);
                trace!("uevent: {:?}", event);
                Ok(event)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(SysError::Io(std::io::Error::from(e))),
        }
    }
}
