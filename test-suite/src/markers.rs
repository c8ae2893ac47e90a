// Licensed under the Apache-2.0 license

use crate::options::{ModelArg, Options, Suite};

/// Tags used to select the tests that apply to a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Part of the basic suite.
    Basic,
    /// Only part of the full and slow suites.
    Full,
    /// Only part of the slow suite.
    Slow,
    /// Needs a simulated device.
    Virtual,
    /// Does not run on the hil setup.
    HilSkip,
    /// Does not run on a Nitrokey Passkey.
    NkpkSkip,
}

/// Returns why a test with `markers` is skipped, or `None` if it runs.
pub fn skip_reason(markers: &[Marker], options: &Options) -> Option<&'static str> {
    let has = |marker| markers.contains(&marker);
    if !options.virtual_tests && has(Marker::Virtual) {
        return Some("need --virtual option to run");
    }
    if options.hil && has(Marker::HilSkip) {
        return Some("does not run on hil");
    }
    if options.model == ModelArg::Nkpk && has(Marker::NkpkSkip) {
        return Some("does not run on model nkpk");
    }
    if options.test_suite != Suite::Slow && has(Marker::Slow) {
        return Some("slow test-suite not selected");
    }
    if options.test_suite < Suite::Full && has(Marker::Full) {
        return Some("full test-suite not selected");
    }
    if options.test_suite == Suite::Basic && !has(Marker::Basic) {
        return Some("normal test-suite not selected");
    }
    None
}
