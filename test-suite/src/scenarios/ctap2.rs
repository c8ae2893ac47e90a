// Licensed under the Apache-2.0 license

//! Runs the CTAP2 conformance tool against a device, one test id at a time.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use nitrokey_hil_hw_model::expect::Session;
use nitrokey_hil_hw_model::Device;
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::harness::{Module, TestBody, TestCase};
use crate::markers::Marker;

const PROMPT_REBOOT: &str = "Please replug the device, then hit enter.";
const PROMPT_TOUCH: &str = "Please touch your security key!";
const OUTPUT_RESULTS: &str = "RESULTS";

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

static TEST_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"BaseTest\(\s*"(\w+)""#).unwrap());

fn extract_test_ids(text: &str) -> Vec<String> {
    TEST_ID
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Collects the test ids declared in `src/tests/*.cc` of the tool checkout.
/// A missing checkout yields no tests.
pub fn detect_tests(tool_dir: &Path) -> Vec<String> {
    let tests_dir = tool_dir.join("src").join("tests");
    let mut sources: Vec<PathBuf> = WalkDir::new(&tests_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "cc"))
        .collect();
    if sources.is_empty() {
        debug!("no CTAP2 tests found in {}", tests_dir.display());
    }
    sources.sort();

    let mut ids = vec![];
    for source in sources {
        match fs::read_to_string(&source) {
            Ok(text) => ids.extend(extract_test_ids(&text)),
            Err(e) => warn!("failed to read {}: {e}", source.display()),
        }
    }
    ids
}

fn run_test(tool_dir: &Path, test_id: &str, device: &mut Device) -> Result<()> {
    let mut cmd = Command::new("bazel");
    cmd.args(["--output_user_root", "/app/cache/bazel", "run", "//:fido2_conformance", "--"])
        .arg(format!("--token_path=/dev/{}", device.hidraw()))
        .arg(format!("--test_ids={test_id}"))
        .current_dir(tool_dir);
    let mut p = Session::spawn_command(cmd)?.with_timeout(TEST_TIMEOUT);

    loop {
        match p.expect_any(&[PROMPT_REBOOT, PROMPT_TOUCH, OUTPUT_RESULTS])? {
            0 => {
                device.reboot()?;
                p.send_line("")?;
            }
            1 => device.confirm_user_presence()?,
            _ => break,
        }
    }
    Ok(())
}

pub fn module(tool_dir: &Path) -> Module {
    let cases = detect_tests(tool_dir)
        .into_iter()
        .map(|test_id| {
            let tool_dir = tool_dir.to_path_buf();
            TestCase::new(
                format!("ctap2[{test_id}]"),
                &[Marker::Virtual],
                TestBody::TouchDevice(Box::new(move |device: &mut Device| {
                    run_test(&tool_dir, &test_id, device)
                })),
            )
        })
        .collect();
    Module::new("ctap2", cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
GetInfoTest::GetInfoTest()
    : BaseTest("get_info", "Tests the return values of GetInfo.",
               {.has_pin = false}, {}) {}

MakeCredentialBadParameterTypesTest::MakeCredentialBadParameterTypesTest()
    : BaseTest(
          "make_credential_bad_parameter_types",
          "Tests if MakeCredential works with parameters of the wrong type.",
          {.has_pin = false}, {Tag::kClientPin}) {}
"#;

    #[test]
    fn test_extract_test_ids() {
        assert_eq!(
            extract_test_ids(SOURCE),
            ["get_info", "make_credential_bad_parameter_types"]
        );
        assert!(extract_test_ids("BaseTest(name)").is_empty());
    }

    #[test]
    fn test_detect_tests() {
        let dir = tempfile::tempdir().unwrap();
        let tests_dir = dir.path().join("src/tests");
        fs::create_dir_all(&tests_dir).unwrap();
        fs::write(tests_dir.join("b.cc"), r#"BaseTest("reset", "")"#).unwrap();
        fs::write(tests_dir.join("a.cc"), SOURCE).unwrap();
        fs::write(tests_dir.join("a.h"), r#"BaseTest("header", "")"#).unwrap();

        assert_eq!(
            detect_tests(dir.path()),
            ["get_info", "make_credential_bad_parameter_types", "reset"]
        );
    }

    #[test]
    fn test_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_tests(&dir.path().join("missing")).is_empty());
        assert!(module(&dir.path().join("missing")).cases.is_empty());
    }

    #[test]
    fn test_module() {
        let dir = tempfile::tempdir().unwrap();
        let tests_dir = dir.path().join("src/tests");
        fs::create_dir_all(&tests_dir).unwrap();
        fs::write(tests_dir.join("a.cc"), SOURCE).unwrap();

        let module = module(dir.path());
        assert_eq!(module.name, "ctap2");
        assert_eq!(module.cases[0].name, "ctap2[get_info]");
        assert_eq!(module.cases[0].markers, [Marker::Virtual]);
        assert!(matches!(module.cases[0].body, TestBody::TouchDevice(_)));
    }
}
