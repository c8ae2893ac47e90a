/*++

Licensed under the Apache-2.0 license.

File Name:

    mod.rs

Abstract:

    File contains fakes for exercising the device lifecycle without a
    usbip-capable host.

--*/
mod fake_host;
mod log;

pub use fake_host::FakeHost;
pub use log::Log;
