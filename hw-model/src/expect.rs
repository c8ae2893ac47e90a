// Licensed under the Apache-2.0 license

//! Drives interactive command line tools through a pseudo terminal.
//!
//! Tools like `nitropy`, `ssh-keygen` or `opgpcard` prompt on their
//! controlling terminal, so the child gets the slave side of a fresh pty as
//! stdin/stdout/stderr and as controlling terminal. The master side is read
//! by a background thread; [`Session::expect`] waits until a literal prompt
//! shows up in the accumulated output and consumes everything up to and
//! including it.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use regex::Regex;

use crate::process::describe;
use crate::{HwModelError, Result};

pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Session {
    command: String,
    child: Child,
    writer: File,
    rx: Receiver<Vec<u8>>,
    buffer: String,
    eof: bool,
    timeout: Duration,
}

impl Session {
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        Self::spawn_command(cmd)
    }

    /// Spawns a prepared command, e.g. one with a working directory or extra
    /// environment. Its stdio is replaced by the pty.
    pub fn spawn_command(mut cmd: Command) -> Result<Self> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None::<&Termios>)?;
        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        cmd.stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));

        // SAFETY: setsid and ioctl are async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(|| {
                // Make the pty the controlling terminal so that prompts that
                // open /dev/tty end up on it too.
                nix::unistd::setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let command = describe(&cmd);
        debug!("spawning {command}");
        let child = cmd.spawn()?;
        // The slave fds held by `cmd` must be closed, or reads from the master
        // never see the end of the child's output.
        drop(cmd);

        let writer = File::from(pty.master);
        let mut reader = writer.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // EIO once the last slave fd is gone
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            command,
            child,
            writer,
            rx,
            buffer: String::new(),
            eof: false,
            timeout: DEFAULT_EXPECT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for `needle` to appear in the output.
    pub fn expect(&mut self, needle: &str) -> Result<()> {
        self.expect_any(&[needle]).map(|_| ())
    }

    /// Waits for the first of `needles` to appear and returns its index.
    pub fn expect_any(&mut self, needles: &[&str]) -> Result<usize> {
        self.expect_with(
            |buffer| {
                needles
                    .iter()
                    .enumerate()
                    .filter_map(|(index, needle)| {
                        buffer
                            .find(needle)
                            .map(|pos| (pos, pos + needle.len(), index))
                    })
                    .min_by_key(|&(pos, _, _)| pos)
                    .map(|(_, end, index)| (end, index))
            },
            || needles.join(" | "),
        )
    }

    /// Waits for `re` to match and returns the matched text.
    pub fn expect_regex(&mut self, re: &Regex) -> Result<String> {
        self.expect_with(
            |buffer| re.find(buffer).map(|m| (m.end(), m.as_str().to_string())),
            || re.to_string(),
        )
    }

    /// Waits for the child to close the terminal.
    pub fn expect_eof(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while !self.eof {
            if !self.fill(deadline) {
                return Err(self.mismatch("EOF".into(), "timeout"));
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Returns all remaining output once the child closed the terminal.
    pub fn read_to_end(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        while !self.eof {
            if !self.fill(deadline) {
                return Err(self.mismatch("EOF".into(), "timeout"));
            }
        }
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("{} << {line:?}", self.command);
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reaps the child.
    pub fn wait(mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }

    fn expect_with<T>(
        &mut self,
        mut find: impl FnMut(&str) -> Option<(usize, T)>,
        expected: impl FnOnce() -> String,
    ) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some((end, value)) = find(&self.buffer) {
                self.buffer.drain(..end);
                return Ok(value);
            }
            if self.eof {
                return Err(self.mismatch(expected(), "EOF"));
            }
            if !self.fill(deadline) {
                return Err(self.mismatch(expected(), "timeout"));
            }
        }
    }

    /// Pulls the next chunk of output. Returns false if the deadline passed.
    fn fill(&mut self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(chunk) => {
                let chunk = String::from_utf8_lossy(&chunk);
                trace!("{} >> {chunk:?}", self.command);
                self.buffer.push_str(&chunk);
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    fn mismatch(&self, expected: String, reason: &'static str) -> HwModelError {
        HwModelError::PromptMismatch {
            command: self.command.clone(),
            expected,
            reason,
            output: self.buffer.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
