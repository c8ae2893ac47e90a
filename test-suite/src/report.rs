// Licensed under the Apache-2.0 license

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use log::warn;
use nitrokey_hil_hw_model::process::{check_output, DEFAULT_TIMEOUT};
use nitrokey_hil_hw_model::upgrade::OLD_SUFFIX;

/// Version reported by `<bin_dir>/<binary> --version`, e.g. `v0.3.1`.
pub fn binary_version(bin_dir: &Path, binary: &str) -> String {
    let path = bin_dir.join(binary);
    if !path.exists() {
        return "[missing]".into();
    }
    match check_output(Command::new(&path).arg("--version"), DEFAULT_TIMEOUT) {
        Ok(output) => parse_version(&output).unwrap_or_else(|| "[unknown]".into()),
        Err(e) => {
            warn!("failed to query version of {}: {e}", path.display());
            "[error]".into()
        }
    }
}

fn parse_version(output: &str) -> Option<String> {
    output.split_whitespace().nth(1).map(|v| format!("v{v}"))
}

fn combined_version(runner: String, provisioner: String) -> String {
    if runner == provisioner {
        runner
    } else {
        format!("{runner}/{provisioner}")
    }
}

/// The first line printed by a run, e.g. `usbip-runner: v0.3.1 (old: v0.3.0)`.
pub fn report_header(upgrade: bool, mut version: impl FnMut(&str) -> String) -> String {
    let mut header = format!(
        "usbip-runner: {}",
        combined_version(version("usbip-runner"), version("usbip-provisioner"))
    );
    if upgrade {
        let runner = version(&format!("usbip-runner-{OLD_SUFFIX}"));
        let provisioner = version(&format!("usbip-provisioner-{OLD_SUFFIX}"));
        header += &format!(" (old: {})", combined_version(runner, provisioner));
    }
    header
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "PASSED"),
            Self::Failed(_) => write!(f, "FAILED"),
            Self::Skipped(reason) => write!(f, "SKIPPED ({reason})"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestResult {
    pub id: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct Summary {
    results: Vec<TestResult>,
}

impl Summary {
    pub fn record(&mut self, id: impl Into<String>, outcome: Outcome, duration: Duration) {
        self.results.push(TestResult {
            id: id.into(),
            outcome,
            duration,
        });
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| *o == Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn write(&self, mut w: impl Write) -> io::Result<()> {
        for result in &self.results {
            writeln!(w, "{} {}", result.id, result.outcome)?;
        }
        let failures: Vec<_> = self
            .results
            .iter()
            .filter_map(|r| match &r.outcome {
                Outcome::Failed(message) => Some((&r.id, message)),
                _ => None,
            })
            .collect();
        if !failures.is_empty() {
            writeln!(w, "\nfailures:")?;
            for (id, message) in failures {
                writeln!(w, "  {id}: {message}")?;
            }
        }
        let total: Duration = self.results.iter().map(|r| r.duration).sum();
        writeln!(
            w,
            "\n{} passed, {} failed, {} skipped in {:.2}s",
            self.passed(),
            self.failed(),
            self.skipped(),
            total.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn versions(entries: &[(&str, &str)]) -> impl FnMut(&str) -> String {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |binary| {
            map.get(binary)
                .cloned()
                .unwrap_or_else(|| "[missing]".into())
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("usbip-runner 0.3.1\n"),
            Some("v0.3.1".into())
        );
        assert_eq!(parse_version("usbip-runner\n"), None);
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(binary_version(dir.path(), "usbip-runner"), "[missing]");
    }

    #[test]
    fn test_report_header() {
        let same = versions(&[("usbip-runner", "v0.3.1"), ("usbip-provisioner", "v0.3.1")]);
        assert_eq!(report_header(false, same), "usbip-runner: v0.3.1");

        let differ = versions(&[("usbip-runner", "v0.3.1")]);
        assert_eq!(
            report_header(false, differ),
            "usbip-runner: v0.3.1/[missing]"
        );

        let upgrade = versions(&[
            ("usbip-runner", "v0.3.1"),
            ("usbip-provisioner", "v0.3.1"),
            ("usbip-runner-old", "v0.2.0"),
            ("usbip-provisioner-old", "v0.2.0"),
        ]);
        assert_eq!(
            report_header(true, upgrade),
            "usbip-runner: v0.3.1 (old: v0.2.0)"
        );
    }

    #[test]
    fn test_summary() {
        let mut summary = Summary::default();
        summary.record("basic::lsusb", Outcome::Passed, Duration::from_millis(500));
        summary.record(
            "basic::secrets",
            Outcome::Skipped("normal test-suite not selected".into()),
            Duration::ZERO,
        );
        assert!(summary.success());
        summary.record(
            "basic::list",
            Outcome::Failed("no matching device found".into()),
            Duration::from_millis(1500),
        );
        assert!(!summary.success());
        assert_eq!(
            (summary.passed(), summary.failed(), summary.skipped()),
            (1, 1, 1)
        );

        let mut out = vec![];
        summary.write(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "basic::lsusb PASSED\n\
             basic::secrets SKIPPED (normal test-suite not selected)\n\
             basic::list FAILED\n\
             \n\
             failures:\n  \
             basic::list: no matching device found\n\
             \n\
             1 passed, 1 failed, 1 skipped in 2.00s\n"
        );
    }
}
