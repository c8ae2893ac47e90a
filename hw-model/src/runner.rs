// Licensed under the Apache-2.0 license

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::{Result, SimulatorState};

/// A running simulator process.
pub trait RunnerProcess {
    fn id(&self) -> u32;

    /// Stops the process and reaps it. Calling this more than once is fine.
    fn terminate(&mut self) -> Result<()>;

    /// Tells the simulator that the user touched the key.
    fn send_user_presence_signal(&mut self) -> Result<()>;
}

/// Command line flags passed to `usbip-runner` / `usbip-provisioner`.
pub fn runner_args(state: &SimulatorState) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--ifs".into(), state.ifs.clone().into()];
    if let Some(efs) = &state.efs {
        args.push("--efs".into());
        args.push(efs.clone().into());
    }
    args.push("--serial".into());
    args.push(format!("0x{}", state.serial).into());
    args.push("--user-presence".into());
    let user_presence = if state.user_presence {
        "signal"
    } else {
        "accept-all"
    };
    args.push(user_presence.into());
    args
}

/// A simulator child process. Dropping it terminates the process.
pub struct UsbipRunner {
    child: Child,
    terminated: bool,
}

impl UsbipRunner {
    pub fn spawn(binary: &Path, state: &SimulatorState) -> Result<Self> {
        let mut cmd = Command::new(binary);
        cmd.args(runner_args(state));
        if std::env::var_os("RUST_LOG").is_none() {
            cmd.env("RUST_LOG", "info");
        }
        // SAFETY: prctl is a syscall which is atomic and thus async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                // Don't leave the simulator (and its usbip export) behind if the
                // harness dies.
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        debug!(
            "{} spawned: pid={}, ifs={}, efs={:?}, serial={}",
            binary.display(),
            child.id(),
            state.ifs.display(),
            state.efs,
            state.serial
        );
        Ok(Self::from_child(child))
    }

    pub(crate) fn from_child(child: Child) -> Self {
        Self {
            child,
            terminated: false,
        }
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(self.child.id() as i32), signal)?;
        Ok(())
    }
}

impl RunnerProcess for UsbipRunner {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if self.child.try_wait()?.is_none() {
            match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
                // already gone, just reap it
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let status = self.child.wait()?;
        self.terminated = true;
        debug!("runner pid={} exited: {status}", self.child.id());
        Ok(())
    }

    fn send_user_presence_signal(&mut self) -> Result<()> {
        self.signal(Signal::SIGUSR1)
    }
}

impl Drop for UsbipRunner {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("failed to terminate runner pid={}: {e}", self.child.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn state(efs: Option<&str>, user_presence: bool) -> SimulatorState {
        SimulatorState {
            ifs: PathBuf::from("/tmp/s/ifs.bin"),
            efs: efs.map(PathBuf::from),
            serial: "00112233445566778899AABBCCDDEEFF".into(),
            user_presence,
            pin: None,
        }
    }

    #[test]
    fn test_runner_args() {
        assert_eq!(
            runner_args(&state(Some("/tmp/s/efs.bin"), false)),
            [
                "--ifs",
                "/tmp/s/ifs.bin",
                "--efs",
                "/tmp/s/efs.bin",
                "--serial",
                "0x00112233445566778899AABBCCDDEEFF",
                "--user-presence",
                "accept-all"
            ]
            .map(OsString::from)
        );
        assert_eq!(
            runner_args(&state(None, true)),
            [
                "--ifs",
                "/tmp/s/ifs.bin",
                "--serial",
                "0x00112233445566778899AABBCCDDEEFF",
                "--user-presence",
                "signal"
            ]
            .map(OsString::from)
        );
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut runner = UsbipRunner::from_child(child);
        runner.terminate().unwrap();
        runner.terminate().unwrap();
        assert!(runner.child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_terminate_after_exit() {
        let child = Command::new("true").spawn().unwrap();
        let mut runner = UsbipRunner::from_child(child);
        std::thread::sleep(std::time::Duration::from_millis(100));
        runner.terminate().unwrap();
    }

    #[test]
    fn test_failed_reap_is_retried() {
        let child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let mut runner = UsbipRunner::from_child(child);
        // reaped behind the back of `Child`, so its own wait fails with ECHILD
        nix::sys::wait::waitpid(pid, None).unwrap();
        assert!(runner.terminate().is_err());
        assert!(!runner.terminated);
        assert!(runner.terminate().is_err());
    }
}
