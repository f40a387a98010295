//! External-linker collaborator.
//!
//! The backend does not link; it accumulates an argument list and hands it to
//! the system linker as a single synchronous child process. Process spawning
//! sits behind a small trait so the invocation can be mocked in tests.

use std::io;
use std::process::Command;

use log::{debug, error};

/// Run an external process to completion and report its exit status.
pub trait ProcessRunner {
    fn run(&mut self, argv: &[String]) -> io::Result<i32>;
}

/// Spawns the process through the operating system and waits for it.
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&mut self, argv: &[String]) -> io::Result<i32> {
        let status = Command::new(&argv[0]).args(&argv[1..]).status()?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Accumulated linker invocation.
///
/// Construction pre-seeds the fixed platform argument set; callers append
/// object files and options, then invoke once.
pub struct Linker {
    args: Vec<String>,
}

impl Linker {
    pub fn new() -> Self {
        let mut linker = Self { args: Vec::new() };
        linker.arg("/usr/bin/ld");
        linker.arg("--eh-frame-hdr");
        linker.arg("-e");
        linker.arg("_start");
        linker.arg("-dynamic-linker");
        linker.arg("/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2");
        linker.arg("/usr/lib/x86_64-linux-gnu/crt1.o");
        linker.arg("/usr/lib/x86_64-linux-gnu/crti.o");
        linker.arg("/usr/lib/x86_64-linux-gnu/crtn.o");
        linker.arg("-L/usr/local/lib");
        linker.arg("-L/usr/lib");
        linker
    }

    /// Append one argument.
    pub fn arg(&mut self, option: impl Into<String>) {
        self.args.push(option.into());
    }

    /// The accumulated argument list.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Invoke the system linker, returning its exit status. A process that
    /// could not be started reports a generic failure status.
    pub fn invoke(&mut self) -> i32 {
        self.invoke_with(&mut SystemRunner)
    }

    /// Invoke through an explicit runner. The standard C library link flag
    /// terminates the argument list.
    pub fn invoke_with(&mut self, runner: &mut dyn ProcessRunner) -> i32 {
        self.arg("-lc");
        debug!("linking: {}", self.args.join(" "));
        match runner.run(&self.args) {
            Ok(status) => status,
            Err(e) => {
                error!("failed to start linker process: {}", e);
                1
            }
        }
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingRunner {
        argv: Vec<String>,
        status: i32,
    }

    impl ProcessRunner for RecordingRunner {
        fn run(&mut self, argv: &[String]) -> io::Result<i32> {
            self.argv = argv.to_vec();
            Ok(self.status)
        }
    }

    struct FailingRunner;

    impl ProcessRunner for FailingRunner {
        fn run(&mut self, _argv: &[String]) -> io::Result<i32> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    #[test]
    fn test_preseeded_arguments() {
        let linker = Linker::new();
        assert_eq!(linker.args()[0], "/usr/bin/ld");
        assert!(linker.args().contains(&"-dynamic-linker".to_string()));
        assert!(linker.args().contains(&"-L/usr/lib".to_string()));
    }

    #[test]
    fn test_invoke_appends_libc_and_propagates_status() {
        let mut linker = Linker::new();
        linker.arg("a.o");
        linker.arg("-o");
        linker.arg("a.out");
        let mut runner = RecordingRunner {
            argv: Vec::new(),
            status: 3,
        };
        assert_eq!(linker.invoke_with(&mut runner), 3);
        assert_eq!(runner.argv.last().unwrap(), "-lc");
        assert!(runner.argv.contains(&"a.o".to_string()));
    }

    #[test]
    fn test_spawn_failure_reports_generic_status() {
        let mut linker = Linker::new();
        assert_eq!(linker.invoke_with(&mut FailingRunner), 1);
    }
}
