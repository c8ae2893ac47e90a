// Licensed under the Apache-2.0 license

//! The test modules. Each one drives external tools against the device and
//! checks what they report.

use rand::Rng;

use nitrokey_hil_hw_model::{Device, DynUpgradeTest, UpgradeTest};

use crate::harness::{Module, TestBody, TestCase};
use crate::options::Options;

pub mod basic;
pub mod ctap2;
pub mod fido2;
pub mod ssh;
pub mod upgrade;

/// Upgrade tests that need nothing but a device. They run against the
/// module device in their own module and across an upgrade in the upgrade
/// module.
pub fn exec_upgrade_tests() -> Vec<Box<dyn DynUpgradeTest>> {
    vec![Box::new(fido2::Fido2), Box::new(basic::Secrets::new())]
}

/// Runs `test` on the module device.
pub fn device_test<T: UpgradeTest + 'static>(test: T) -> TestCase {
    TestCase::new(
        test.name(),
        &[],
        TestBody::Device(Box::new(move |device: &mut Device| test.run(device))),
    )
}

/// Eight random digits.
pub fn random_pin() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

pub fn modules(options: &Options) -> Vec<Module> {
    vec![
        basic::module(),
        fido2::touch_module(),
        ssh::module(),
        ctap2::module(&options.ctap2_test_tool),
        upgrade::module(options.upgrade),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_random_pin() {
        let pin = random_pin();
        assert_eq!(pin.len(), 8);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_test_ids_are_unique() {
        let options = Options::try_parse_from(["nitrokey-hil", "--upgrade"]).unwrap();
        let mut ids: Vec<String> = modules(&options)
            .iter()
            .flat_map(|m| m.cases.iter().map(move |c| format!("{}::{}", m.name, c.name)))
            .collect();
        let count = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), count);
        assert!(ids.contains(&"upgrade::ssh_resident[ed25519]".to_string()));
        assert!(ids.contains(&"basic::secrets".to_string()));
        assert!(ids.contains(&"basic::fido2_resident".to_string()));
        assert!(ids.contains(&"touch::fido2".to_string()));
        assert!(ids.contains(&"upgrade::fido2".to_string()));
        assert!(ids.contains(&"upgrade::fido2_resident".to_string()));
    }
}
