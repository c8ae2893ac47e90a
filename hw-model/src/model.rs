// Licensed under the Apache-2.0 license

use crate::{HwModelError, Result};

pub const VID_NITROKEY: u16 = 0x20a0;
pub const PID_NK3: u16 = 0x42b2;
pub const PID_NKPK: u16 = 0x42f3;
pub const PIDS: [u16; 2] = [PID_NK3, PID_NKPK];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Model {
    Nk3,
    Nkpk,
}

impl Model {
    /// Human readable name, as printed by `nitropy <command> list`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nk3 => "Nitrokey 3",
            Self::Nkpk => "Nitrokey Passkey",
        }
    }

    /// The nitropy subcommand for this model.
    pub fn command(self) -> &'static str {
        match self {
            Self::Nk3 => "nk3",
            Self::Nkpk => "nkpk",
        }
    }

    pub fn pid(self) -> u16 {
        match self {
            Self::Nk3 => PID_NK3,
            Self::Nkpk => PID_NKPK,
        }
    }

    pub fn from_vid_pid(vid: u16, pid: u16) -> Result<Self> {
        match (vid, pid) {
            (VID_NITROKEY, PID_NK3) => Ok(Self::Nk3),
            (VID_NITROKEY, PID_NKPK) => Ok(Self::Nkpk),
            _ => Err(HwModelError::UnsupportedModel { vid, pid }),
        }
    }
}
