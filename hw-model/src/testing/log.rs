/*++

Licensed under the Apache-2.0 license.

File Name:

    log.rs

Abstract:

    File contains a shared call log for fakes used in unit tests.

--*/
use std::{cell::RefCell, fmt::Write, rc::Rc};

/// A call log that can be written without `&mut self`. Clones share the same
/// buffer, so a fake and the runners it hands out can record into one log.
#[derive(Clone, Default)]
pub struct Log {
    log: Rc<RefCell<String>>,
}
impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything recorded so far and clears the log.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    /// Returns a writer that can be used with write!() or writeln!().
    pub fn w(&self) -> (impl Write + '_) {
        LogWriter { log: &self.log }
    }
}

struct LogWriter<'a> {
    log: &'a RefCell<String>,
}
impl Write for LogWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        Write::write_str(&mut *self.log.borrow_mut(), s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_between_clones() {
        let log = Log::new();
        writeln!(log.clone().w(), "spawn()").unwrap();
        writeln!(log.w(), "attach()").unwrap();
        assert_eq!("spawn()\nattach()\n", log.take());
        assert_eq!("", log.take());
    }
}
