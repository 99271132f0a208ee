//! Minimal CLI parsing for worker invocation modes.

use std::env;

use uuid::Uuid;

/// How this process was asked to run
#[derive(Debug, Default)]
pub struct CliOptions {
    /// Run one task and exit
    pub task_id: Option<Uuid>,
    /// Drain queued tasks once and exit instead of running the daemon
    pub drain_once: bool,
}

impl CliOptions {
    pub fn from_args() -> Self {
        let mut options = CliOptions::default();
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--task" => {
                    if let Some(value) = args.next() {
                        options.task_id = Uuid::parse_str(&value).ok();
                    }
                }
                "--drain-once" => options.drain_once = true,
                _ if arg.starts_with("--task=") => {
                    if let Some(value) = arg.split_once('=').map(|(_, v)| v) {
                        options.task_id = Uuid::parse_str(value).ok();
                    }
                }
                _ => {}
            }
        }
        options
    }
}
