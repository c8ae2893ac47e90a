// Licensed under the Apache-2.0 license

//! SSH keys backed by the device: plain keys whose private part only lives in
//! the key file, and `-sk` resident keys that can be downloaded again.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{ensure, Context, Result};
use log::{debug, warn};
use nitrokey_hil_hw_model::expect::Session;
use nitrokey_hil_hw_model::{Device, UpgradeTest};
use nix::unistd::{chown, User};
use tempfile::TempDir;

use crate::harness::Module;
use crate::scenarios::{device_test, random_pin};

pub const SSH_KEY_TYPES: [&str; 2] = ["ecdsa", "ed25519"];
pub const SSH_USER: &str = "user";

/// Private and public key file contents.
pub type KeyPair = (Vec<u8>, Vec<u8>);

/// Generates a key of `key_type` in `dir`.
pub fn keygen(dir: &Path, key_type: &str, resident: bool, pin: Option<&str>) -> Result<KeyPair> {
    let key = dir.join(key_type);
    let pubkey = key.with_extension("pub");
    let mut cmd = Command::new("ssh-keygen");
    cmd.args(["-t", key_type, "-f"])
        .arg(&key)
        .args(["-C", "fido", "-P", ""]);
    if resident {
        cmd.args(["-O", "resident"]);
    }
    let mut p = Session::spawn_command(cmd)?;
    if let Some(pin) = pin {
        p.expect("Enter PIN for authenticator")?;
        p.send_line(pin)?;
    }
    p.expect("public key has been saved")?;
    Ok((fs::read(&key)?, fs::read(&pubkey)?))
}

/// Writes a key pair to `dir` and returns the paths of the key files.
pub fn keypair(dir: &Path, (key, pubkey): &KeyPair) -> Result<(PathBuf, PathBuf)> {
    let key_path = dir.join("key");
    let pubkey_path = dir.join("key.pub");
    fs::write(&key_path, key)?;
    fs::write(&pubkey_path, pubkey)?;
    Ok((key_path, pubkey_path))
}

/// `~user/.ssh/authorized_keys` holding a single key. Removed on drop.
pub struct AuthorizedKey {
    path: PathBuf,
}

impl AuthorizedKey {
    pub fn install(pubkey: &[u8]) -> Result<Self> {
        let user = User::from_name(SSH_USER)?
            .with_context(|| format!("user {SSH_USER} does not exist"))?;
        let ssh_dir = user.dir.join(".ssh");
        if !ssh_dir.exists() {
            DirBuilder::new().mode(0o700).create(&ssh_dir)?;
            chown(&ssh_dir, Some(user.uid), Some(user.gid))?;
        }
        let path = ssh_dir.join("authorized_keys");
        fs::write(&path, pubkey)?;
        chown(&path, Some(user.uid), Some(user.gid))?;
        debug!("installed {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for AuthorizedKey {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove {}: {e}", self.path.display());
        }
    }
}

/// Runs `cmd` on localhost as [`SSH_USER`], authenticating with `key`.
pub fn ssh_command(key: &Path, cmd: &str) -> Result<Session> {
    let mut ssh = Command::new("ssh");
    ssh.arg("-i")
        .arg(key)
        .args([
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            &format!("{SSH_USER}@localhost"),
            cmd,
        ]);
    Ok(Session::spawn_command(ssh)?)
}

fn login(state: &KeyPair, dir: &Path) -> Result<()> {
    let (key_path, _) = keypair(dir, state)?;
    let _authorized = AuthorizedKey::install(&state.1)?;
    ssh_command(&key_path, "whoami")?.expect(SSH_USER)?;
    Ok(())
}

pub struct SshContext<'a> {
    pub device: &'a mut Device,
    pub dir: TempDir,
}

fn context(device: &mut Device) -> Result<SshContext<'_>> {
    Ok(SshContext {
        device,
        dir: tempfile::tempdir()?,
    })
}

/// Logs in with a key generated by the device.
pub struct Ssh {
    key_type: &'static str,
}

impl Ssh {
    pub fn new(key_type: &'static str) -> Self {
        Self { key_type }
    }
}

impl UpgradeTest for Ssh {
    type Context<'a> = SshContext<'a>;
    type State = KeyPair;

    fn name(&self) -> String {
        format!("ssh[{}]", self.key_type)
    }

    fn context<'a>(&self, device: &'a mut Device) -> Result<SshContext<'a>> {
        context(device)
    }

    fn prepare(&self, context: &mut SshContext<'_>) -> Result<KeyPair> {
        keygen(context.dir.path(), self.key_type, false, None)
    }

    fn verify(&self, context: &mut SshContext<'_>, state: KeyPair) -> Result<()> {
        login(&state, context.dir.path())
    }
}

/// Logs in with a resident key, then downloads the key from the device.
pub struct SshResident {
    key_type: String,
    pin: String,
}

impl SshResident {
    pub fn new(key_type: &str) -> Self {
        Self {
            key_type: format!("{key_type}-sk"),
            pin: random_pin(),
        }
    }

    /// Name of the key file written by `ssh-keygen -K`.
    fn downloaded_key_name(&self) -> String {
        format!("id_{}_rk", self.key_type.replace('-', "_"))
    }
}

impl UpgradeTest for SshResident {
    type Context<'a> = SshContext<'a>;
    type State = KeyPair;

    fn name(&self) -> String {
        format!(
            "ssh_resident[{}]",
            self.key_type.trim_end_matches("-sk")
        )
    }

    fn context<'a>(&self, device: &'a mut Device) -> Result<SshContext<'a>> {
        context(device)
    }

    fn prepare(&self, context: &mut SshContext<'_>) -> Result<KeyPair> {
        context.device.set_pin(&self.pin)?;
        keygen(context.dir.path(), &self.key_type, true, Some(&self.pin))
    }

    fn verify(&self, context: &mut SshContext<'_>, state: KeyPair) -> Result<()> {
        login(&state, context.dir.path())?;

        let download_dir = context.dir.path().join("download");
        fs::create_dir(&download_dir)?;
        let mut cmd = Command::new("ssh-keygen");
        cmd.arg("-K").current_dir(&download_dir);
        let mut p = Session::spawn_command(cmd)?;
        p.expect("Enter PIN for authenticator")?;
        p.send_line(&self.pin)?;
        p.expect("Enter passphrase")?;
        p.send_line("")?;
        p.expect("Enter same passphrase")?;
        p.send_line("")?;
        let filename = self.downloaded_key_name();
        p.expect(&filename)?;
        // TODO: compare with the generated key once it is clear why parts of
        // the downloaded key differ
        ensure!(
            download_dir.join(&filename).exists(),
            "{filename} was not downloaded"
        );
        Ok(())
    }
}

pub fn module() -> Module {
    let mut cases = vec![];
    for key_type in SSH_KEY_TYPES {
        cases.push(device_test(Ssh::new(key_type)));
    }
    for key_type in SSH_KEY_TYPES {
        cases.push(device_test(SshResident::new(key_type)));
    }
    Module::new("ssh", cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Ssh::new("ecdsa").name(), "ssh[ecdsa]");
        let resident = SshResident::new("ed25519");
        assert_eq!(resident.name(), "ssh_resident[ed25519]");
        assert_eq!(resident.key_type, "ed25519-sk");
        assert_eq!(resident.downloaded_key_name(), "id_ed25519_sk_rk");
        assert_eq!(resident.pin.len(), 8);
    }

    #[test]
    fn test_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let state = (b"private".to_vec(), b"ssh-ed25519 AAAA fido".to_vec());
        let (key, pubkey) = keypair(dir.path(), &state).unwrap();
        assert_eq!(key, dir.path().join("key"));
        assert_eq!(fs::read(key).unwrap(), b"private");
        assert_eq!(fs::read(pubkey).unwrap(), b"ssh-ed25519 AAAA fido");
    }

    #[test]
    fn test_module() {
        let names: Vec<_> = module().cases.into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            [
                "ssh[ecdsa]",
                "ssh[ed25519]",
                "ssh_resident[ecdsa]",
                "ssh_resident[ed25519]"
            ]
        );
    }
}
