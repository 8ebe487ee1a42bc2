//! Configurable fake command executor for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::exec::{CommandExecutor, ExecOutput};

type Handler = Box<dyn Fn(&str, &[String]) -> Result<ExecOutput> + Send + Sync>;

/// A fake [`CommandExecutor`] with per-program handlers.
///
/// Unhandled `which` lookups fail (no tool found); any other unhandled
/// program succeeds with empty output. All calls are recorded.
#[derive(Default)]
pub struct FakeExecutor {
    which_results: Mutex<HashMap<String, String>>,
    handlers: Mutex<Vec<(String, Handler)>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `which <tool>` resolve to `path`.
    pub fn set_which(&self, tool: &str, path: &str) {
        self.which_results
            .lock()
            .expect("fake executor lock")
            .insert(tool.to_string(), path.to_string());
    }

    /// Install a handler for programs whose name contains `fragment`.
    pub fn on_command<F>(&self, fragment: &str, handler: F)
    where
        F: Fn(&str, &[String]) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("fake executor lock")
            .push((fragment.to_string(), Box::new(handler)));
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().expect("fake executor lock").clone()
    }

    fn run(&self, program: &str, args: Vec<String>) -> Result<ExecOutput> {
        self.calls
            .lock()
            .expect("fake executor lock")
            .push((program.to_string(), args.clone()));

        if program == "which" {
            let which = self.which_results.lock().expect("fake executor lock");
            return match args.first().and_then(|tool| which.get(tool)) {
                Some(path) => Ok(ExecOutput {
                    success: true,
                    code: Some(0),
                    stdout: format!("{path}\n"),
                    stderr: String::new(),
                }),
                None => Ok(ExecOutput {
                    success: false,
                    code: Some(1),
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            };
        }

        let handlers = self.handlers.lock().expect("fake executor lock");
        for (fragment, handler) in handlers.iter() {
            if program.contains(fragment.as_str()) {
                return handler(program, &args);
            }
        }

        Ok(ExecOutput {
            success: true,
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, program: &str, args: Vec<String>) -> Result<ExecOutput> {
        self.run(program, args)
    }

    fn execute_with_timeout(
        &self,
        program: &str,
        args: Vec<String>,
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        self.run(program, args)
    }
}

/// Convenience constructor for a failing command result.
pub fn failed_output(stderr: &str) -> Result<ExecOutput> {
    Ok(ExecOutput {
        success: false,
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// Convenience constructor for an error result.
pub fn exec_error(message: &str) -> Result<ExecOutput> {
    Err(HarnessError::FlashCommandFailed {
        stderr: message.to_string(),
    })
}
