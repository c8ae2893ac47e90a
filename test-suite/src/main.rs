// Licensed under the Apache-2.0 license

use std::io::stdout;
use std::rc::Rc;

use clap::Parser;
use nitrokey_hil_hw_model::SystemHost;
use simple_logger::SimpleLogger;

mod fixtures;
mod harness;
mod markers;
mod options;
mod report;
mod scenarios;

use fixtures::Fixtures;
use harness::Harness;
use options::Options;
use report::{binary_version, report_header};

fn run(options: &Options) -> anyhow::Result<bool> {
    println!(
        "{}",
        report_header(options.upgrade, |binary| binary_version(&options.bin_dir, binary))
    );

    let fixtures = Fixtures::new(options, Rc::new(SystemHost::default()));
    let summary = Harness::new(options, fixtures).run(scenarios::modules(options));
    summary.write(stdout().lock())?;
    Ok(summary.success())
}

fn main() {
    let options = Options::parse();
    SimpleLogger::new()
        .with_level(options.log_level)
        .init()
        .unwrap();
    match run(&options) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
