// Licensed under the Apache-2.0 license

use log::debug;

use crate::expect::Session;
use crate::Result;

pub const PROMPT_OLD_PIN: &str = "enter old pin";
pub const PROMPT_NEW_PIN: &str = "enter new pin";
pub const PROMPT_CONFIRM_PIN: &str = "confirm new pin";
pub const PROMPT_DONE: &str = "done";

/// The commands used to set or change the FIDO2 PIN.
#[derive(Clone, Debug)]
pub struct PinCommand {
    pub set_pin: Vec<String>,
    pub change_pin: Vec<String>,
}

impl Default for PinCommand {
    fn default() -> Self {
        Self {
            set_pin: ["nitropy", "fido2", "set-pin"].map(String::from).to_vec(),
            change_pin: ["nitropy", "fido2", "change-pin"].map(String::from).to_vec(),
        }
    }
}

impl PinCommand {
    /// Sets the PIN to `new_pin`, changing it from `old_pin` if one is set.
    pub fn run(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()> {
        let mut p = match old_pin {
            Some(old_pin) => {
                debug!("changing FIDO2 PIN");
                let mut p = spawn(&self.change_pin)?;
                p.expect(PROMPT_OLD_PIN)?;
                p.send_line(old_pin)?;
                p
            }
            None => {
                debug!("setting FIDO2 PIN");
                spawn(&self.set_pin)?
            }
        };
        p.expect(PROMPT_NEW_PIN)?;
        p.send_line(new_pin)?;
        p.expect(PROMPT_CONFIRM_PIN)?;
        p.send_line(new_pin)?;
        p.expect(PROMPT_DONE)?;
        Ok(())
    }
}

fn spawn(argv: &[String]) -> Result<Session> {
    let (program, args) = argv.split_first().map_or(("", &[][..]), |(p, a)| (p.as_str(), a));
    Session::spawn(program, args)
}

/// Runs the default `nitropy fido2` PIN commands.
pub fn set_pin(old_pin: Option<&str>, new_pin: &str) -> Result<()> {
    PinCommand::default().run(old_pin, new_pin)
}
