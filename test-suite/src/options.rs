// Licensed under the Apache-2.0 license

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::LevelFilter;
use nitrokey_hil_hw_model::Model;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    Nk3,
    Nkpk,
}

impl From<ModelArg> for Model {
    fn from(model: ModelArg) -> Self {
        match model {
            ModelArg::Nk3 => Model::Nk3,
            ModelArg::Nkpk => Model::Nkpk,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Suite {
    Basic,
    Normal,
    Full,
    Slow,
}

/// Hardware-in-the-loop tests for Nitrokey devices
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Options {
    /// Keep the flash images of simulated devices in ./state
    #[arg(long)]
    pub keep_state: bool,

    /// Run the firmware upgrade tests
    #[arg(long)]
    pub upgrade: bool,

    /// Test the connected device with one of these serials instead of a
    /// simulated device
    #[arg(long, num_args = 0.., value_name = "SERIAL")]
    pub use_usb_devices: Option<Vec<String>>,

    /// Select Nitrokey model
    #[arg(long, value_enum, default_value_t = ModelArg::Nk3)]
    pub model: ModelArg,

    /// Select test suite
    #[arg(long, value_enum, default_value_t = Suite::Basic)]
    pub test_suite: Suite,

    /// Enable virtual tests
    #[arg(long = "virtual")]
    pub virtual_tests: bool,

    /// Disable tests that should not be run on hil
    #[arg(long)]
    pub hil: bool,

    /// Directory containing the usbip-runner and usbip-provisioner binaries
    #[arg(long, default_value = "./bin")]
    pub bin_dir: PathBuf,

    /// Checkout of the CTAP2 conformance test tool
    #[arg(long, default_value = "./external/CTAP2-test-tool")]
    pub ctap2_test_tool: PathBuf,

    #[arg(long, default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,

    /// Only run tests whose id contains one of these strings
    pub filters: Vec<String>,
}

impl Options {
    /// Serials of the physical devices to test, if any.
    pub fn usb_serials(&self) -> Option<&[String]> {
        self.use_usb_devices
            .as_deref()
            .filter(|serials| !serials.is_empty())
    }
}
