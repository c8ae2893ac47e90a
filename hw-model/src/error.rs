// Licensed under the Apache-2.0 license

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::DeviceData;

/// Errors raised while finding, spawning or talking to a device.
#[derive(Error, Debug)]
pub enum HwModelError {
    #[error("{module} kernel module missing -- please run `modprobe vhci-hcd`")]
    VhciMissing { module: String },
    #[error("{name} binary is missing (expected at {})", path.display())]
    BinaryMissing { name: String, path: PathBuf },
    #[error("no matching device found")]
    NoDevice,
    #[error("{} devices connected: {devices:?}", devices.len())]
    AmbiguousMatch { devices: Vec<DeviceData> },
    #[error("no matching device enumerated after {attempts} attempts")]
    EnumerationTimeout { attempts: u32 },
    #[error("hidraw device {} does not show up", path.display())]
    DeviceNotReady { path: PathBuf },
    #[error("confirm_user_presence called but user presence not enabled")]
    UserPresenceDisabled,
    #[error("simulator {} is not running", binary.display())]
    NotRunning { binary: PathBuf },
    #[error("unsupported model: {vid:04x}:{pid:04x}")]
    UnsupportedModel { vid: u16, pid: u16 },
    #[error("expected device with any of these UUIDs: {}, found {found}", expected.join(","))]
    UnexpectedSerial { expected: Vec<String>, found: String },
    #[error("unable to parse USB port path {0:?}")]
    InvalidPortPath(String),
    #[error("invalid serial {0:?}")]
    InvalidSerial(String),
    #[error("process {command} exited with status code {status:?} stderr {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("process {command} did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("{command}: expected {expected:?} but got {reason}; output so far: {output:?}")]
    PromptMismatch {
        command: String,
        expected: String,
        reason: &'static str,
        output: String,
    },
    #[error("CTAPHID: {0}")]
    CtapHid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for HwModelError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(errno.into())
    }
}

pub type Result<T> = std::result::Result<T, HwModelError>;
