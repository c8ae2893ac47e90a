// Licensed under the Apache-2.0 license

//! Prepares state with the old firmware and verifies it with the current
//! one. The tests spawn their own devices and never use the module device.

use std::path::Path;

use nitrokey_hil_hw_model::{DynUpgradeTest, UpgradeEnv};

use crate::harness::{Module, TestBody, TestCase};
use crate::markers::Marker;
use crate::scenarios::exec_upgrade_tests;
use crate::scenarios::fido2::Fido2Resident;
use crate::scenarios::ssh::{Ssh, SshResident, SSH_KEY_TYPES};

fn upgrade_test(test: Box<dyn DynUpgradeTest>) -> TestCase {
    TestCase::new(
        test.test_name(),
        &[Marker::Virtual],
        TestBody::Upgrade(Box::new(
            move |env: &UpgradeEnv, serial: &str, ifs: &Path| test.exec_upgrade(env, serial, ifs),
        )),
    )
}

pub fn module(upgrade: bool) -> Module {
    let mut cases: Vec<TestCase> = exec_upgrade_tests().into_iter().map(upgrade_test).collect();
    cases.push(upgrade_test(Box::new(Fido2Resident::default())));
    for key_type in SSH_KEY_TYPES {
        cases.push(upgrade_test(Box::new(Ssh::new(key_type))));
    }
    for key_type in SSH_KEY_TYPES {
        cases.push(upgrade_test(Box::new(SshResident::new(key_type))));
    }
    Module {
        skip: (!upgrade).then_some("--upgrade not set"),
        ..Module::new("upgrade", cases)
    }
}
