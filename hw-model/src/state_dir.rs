// Licensed under the Apache-2.0 license

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use tempfile::TempDir;

use crate::Result;

pub const KEPT_STATE_ROOT: &str = "./state";

/// Directory holding the flash images of a simulated device.
#[derive(Debug)]
pub enum StateDir {
    /// Left behind for inspection.
    Kept(PathBuf),
    /// Removed on drop.
    Temp(TempDir),
}

impl StateDir {
    /// A fresh directory below `./state` if `keep_state` is set, otherwise a
    /// temporary directory.
    pub fn new(keep_state: bool) -> Result<Self> {
        Self::new_in(keep_state, KEPT_STATE_ROOT)
    }

    pub fn new_in(keep_state: bool, root: impl AsRef<Path>) -> Result<Self> {
        if keep_state {
            let root = root.as_ref();
            fs::create_dir_all(root)?;
            let dir = tempfile::Builder::new().prefix("tmp").tempdir_in(root)?;
            let dir = dir.into_path();
            info!("keeping state in {}", dir.display());
            Ok(Self::Kept(dir))
        } else {
            Ok(Self::Temp(TempDir::new()?))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Kept(path) => path,
            Self::Temp(dir) => dir.path(),
        }
    }

    pub fn ifs(&self) -> PathBuf {
        self.path().join("ifs.bin")
    }

    pub fn efs(&self) -> PathBuf {
        self.path().join("efs.bin")
    }
}
