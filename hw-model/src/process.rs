// Licensed under the Apache-2.0 license

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::{HwModelError, Result};

/// Timeout applied to short-lived helper commands (lsmod, usbip, ...).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        s.push(' ');
        s.push_str(&arg.to_string_lossy());
    }
    s
}

/// Runs `cmd` with inherited stdio and fails unless it exits successfully
/// within `timeout`.
pub fn check_call(cmd: &mut Command, timeout: Duration) -> Result<()> {
    let command = describe(cmd);
    debug!("running {command}");
    let mut child = cmd.spawn()?;
    let status = wait_timeout(&mut child, timeout, &command)?;
    if status.success() {
        Ok(())
    } else {
        Err(HwModelError::CommandFailed {
            command,
            status: status.code(),
            stderr: String::new(),
        })
    }
}

/// Runs `cmd` and returns its stdout, failing unless it exits successfully
/// within `timeout`.
pub fn check_output(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let command = describe(cmd);
    debug!("running {command}");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(|s| thread::spawn(move || read_all(s)));
    let stderr = child.stderr.take().map(|s| thread::spawn(move || read_all(s)));
    let status = wait_timeout(&mut child, timeout, &command)?;
    let stdout = join_reader(stdout)?;
    let stderr = join_reader(stderr)?;
    debug!("{command}: {stdout}");
    if status.success() {
        Ok(stdout)
    } else {
        Err(HwModelError::CommandFailed {
            command,
            status: status.code(),
            stderr,
        })
    }
}

fn read_all(mut r: impl Read) -> io::Result<String> {
    let mut buf = vec![];
    r.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn join_reader(handle: Option<thread::JoinHandle<io::Result<String>>>) -> Result<String> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    let output = handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))??;
    Ok(output)
}

fn wait_timeout(child: &mut Child, timeout: Duration, command: &str) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HwModelError::CommandTimeout {
                command: command.into(),
                timeout,
            });
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_output() {
        let out = check_output(Command::new("echo").arg("hello"), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_check_output_failure_reports_stderr() {
        let err = check_output(
            Command::new("sh").args(["-c", "echo oops >&2; exit 3"]),
            DEFAULT_TIMEOUT,
        )
        .unwrap_err();
        match err {
            HwModelError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert_eq!(command, "sh -c echo oops >&2; exit 3");
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "oops\n");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_check_call() {
        check_call(&mut Command::new("true"), DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(
            check_call(&mut Command::new("false"), DEFAULT_TIMEOUT),
            Err(HwModelError::CommandFailed { status: Some(1), .. })
        ));
    }

    #[test]
    fn test_timeout() {
        let start = Instant::now();
        let err = check_call(Command::new("sleep").arg("10"), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, HwModelError::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
