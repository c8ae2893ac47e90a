// Licensed under the Apache-2.0 license

use std::fs;
use std::process::Command;

use anyhow::{ensure, Context, Result};
use nitrokey_hil_hw_model::expect::Session;
use nitrokey_hil_hw_model::process::{check_output, DEFAULT_TIMEOUT};
use nitrokey_hil_hw_model::{Device, Model, UpgradeTest};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::harness::{Module, TestBody, TestCase};
use crate::markers::Marker;
use crate::scenarios::fido2::Fido2Resident;
use crate::scenarios::{device_test, exec_upgrade_tests, random_pin};

static BLOCK_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new("[1-9][0-9]+").unwrap());

fn nitropy(model: Model, args: &[&str]) -> Result<Session> {
    let mut cmd = Command::new("nitropy");
    cmd.arg(model.command()).args(args);
    Ok(Session::spawn_command(cmd)?)
}

/// Exactly one device with the model's vid:pid is on the bus.
pub fn lsusb(device: &mut Device) -> Result<()> {
    let filter = format!("{:04x}:{:04x}", device.vid(), device.pid());
    let output = check_output(
        Command::new("lsusb").args(["-d", filter.as_str()]),
        DEFAULT_TIMEOUT,
    )?;
    let count = output.lines().count();
    ensure!(
        count == 1,
        "expected one device matching {filter}, found {count}:\n{output}"
    );
    Ok(())
}

pub fn list(device: &mut Device) -> Result<()> {
    let model = device.model()?;
    let mut p = nitropy(model, &["list"])?;
    p.expect(&format!("'{}' keys", model.name()))?;
    p.expect(&format!(
        "/dev/{}: {} {}",
        device.hidraw(),
        model.name(),
        device.serial()
    ))?;
    Ok(())
}

pub fn status(device: &mut Device) -> Result<()> {
    let mut p = nitropy(device.model()?, &["status"])?;
    p.expect("Init status")?;
    p.expect("ok")?;

    p.expect("Free blocks (int):")?;
    p.expect_regex(&BLOCK_COUNT)?;

    p.expect("Free blocks (ext):")?;
    p.expect_regex(&BLOCK_COUNT)?;

    p.expect_eof()?;
    Ok(())
}

/// Resets the OpenPGP card, generates a P-256 signing key and checks a
/// signature made with it.
pub fn opcard_p256(device: &mut Device) -> Result<()> {
    let serial_prefix = device
        .serial()
        .get(..8)
        .with_context(|| format!("serial {} too short", device.serial()))?;
    let card_id = format!("000F:{serial_prefix}");

    let mut p = Session::spawn(
        "opgpcard",
        ["system", "factory-reset", "--card", card_id.as_str()],
    )?;
    p.expect(&format!("Resetting Card {card_id}"))?;
    p.expect_eof()?;

    let dir = tempfile::tempdir()?;
    let data_path = dir.path().join("input-data");
    let upin_path = dir.path().join("user-pin");
    let apin_path = dir.path().join("admin-pin");
    let pkey_path = dir.path().join("public-key.asc");
    let sig_path = dir.path().join("data.sig");
    fs::write(&data_path, "some random data to be signed here")?;
    fs::write(&upin_path, "123456")?;
    fs::write(&apin_path, "12345678")?;

    let mut cmd = Command::new("opgpcard");
    cmd.arg("admin")
        .arg("-P")
        .arg(&apin_path)
        .args(["--card", card_id.as_str(), "generate", "-p"])
        .arg(&upin_path)
        .arg("-o")
        .arg(&pkey_path)
        .arg("nistp256");
    let mut p = Session::spawn_command(cmd)?;
    p.expect("Generate subkey for Signing")?;
    p.expect_eof()?;

    let mut cmd = Command::new("opgpcard");
    cmd.args(["sign", "--card", card_id.as_str(), "-d", "-p"])
        .arg(&upin_path)
        .arg("-o")
        .arg(&sig_path)
        .arg(&data_path);
    Session::spawn_command(cmd)?.expect_eof()?;

    let mut cmd = Command::new("sqv");
    cmd.arg(&sig_path)
        .arg(&data_path)
        .arg("--keyring")
        .arg(&pkey_path)
        .arg("-v");
    let mut p = Session::spawn_command(cmd)?;
    p.expect("1 of 1 signatures are valid")?;
    p.expect_eof()?;
    Ok(())
}

const OTP_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

/// Registers PIN protected HOTP and TOTP credentials and reads them back.
pub struct Secrets {
    pin: String,
}

impl Default for Secrets {
    fn default() -> Self {
        Self { pin: random_pin() }
    }
}

impl Secrets {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(&self, model: Model, args: &[&str]) -> Result<Session> {
        let mut cmd = Command::new("nitropy");
        cmd.args([model.command(), "secrets"]).args(args);
        Ok(Session::spawn_command(cmd)?)
    }

    fn spawn_with_pin(&self, model: Model, args: &[&str]) -> Result<Session> {
        let mut p = self.spawn(model, args)?;
        p.expect("Current PIN")?;
        p.send_line(&self.pin)?;
        Ok(p)
    }

    /// `counter` is the number of HOTP codes generated before.
    fn list_and_get(&self, model: Model, counter: u32) -> Result<()> {
        let output = self.spawn_with_pin(model, &["list"])?.read_to_end()?;
        ensure!(output.contains("test_hotp"), "test_hotp missing: {output}");
        ensure!(output.contains("test_totp"), "test_totp missing: {output}");

        let mut p = self.spawn_with_pin(model, &["get", "test_hotp"])?;
        p.expect(if counter == 0 { "755224" } else { "287082" })?;

        let mut p = self.spawn_with_pin(model, &["get", "test_totp", "--timestamp", "59"])?;
        p.expect("287082")?;
        Ok(())
    }
}

impl UpgradeTest for Secrets {
    type Context<'a> = Model;
    type State = ();

    fn name(&self) -> String {
        "secrets".into()
    }

    fn context<'a>(&self, device: &'a mut Device) -> Result<Model> {
        Ok(device.model()?)
    }

    fn prepare(&self, model: &mut Model) -> Result<()> {
        let model = *model;
        let mut p = self.spawn(model, &["reset"])?;
        p.send_line("y")?;
        p.expect("Done")?;

        let mut p = self.spawn(model, &["set-pin"])?;
        p.expect("Password:")?;
        p.send_line(&self.pin)?;
        p.expect("Repeat for confirmation:")?;
        p.send_line(&self.pin)?;
        p.expect("Password set")?;

        for kind in ["HOTP", "TOTP"] {
            let name = format!("test_{}", kind.to_lowercase());
            self.spawn_with_pin(
                model,
                &["register", "--kind", kind, "--protect-with-pin", name.as_str(), OTP_SECRET],
            )?
            .expect_eof()?;
        }

        self.list_and_get(model, 0)
    }

    fn verify(&self, model: &mut Model, _state: ()) -> Result<()> {
        self.list_and_get(*model, 1)
    }
}

pub fn module() -> Module {
    let mut cases = vec![
        TestCase::new("lsusb", &[Marker::Basic], TestBody::Device(Box::new(lsusb))),
        TestCase::new("list", &[Marker::Basic], TestBody::Device(Box::new(list))),
        TestCase::new(
            "nk3_status",
            &[Marker::Basic, Marker::NkpkSkip],
            TestBody::Device(Box::new(status)),
        ),
        TestCase::new(
            "opcard_p256",
            &[Marker::NkpkSkip],
            TestBody::Device(Box::new(opcard_p256)),
        ),
        device_test(Fido2Resident::default()),
    ];
    for test in exec_upgrade_tests() {
        cases.push(TestCase::new(
            test.test_name(),
            &[],
            TestBody::Device(Box::new(move |device: &mut Device| test.exec(device))),
        ));
    }
    Module::new("basic", cases)
}
