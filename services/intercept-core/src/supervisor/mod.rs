//! Process supervision for external decoder pipelines

mod process;
mod signal;

pub use process::{
    CommandSpec, ExitInfo, LaunchError, ProcessHandle, ProcessOutput, Stage, StopOutcome, Supervisor,
};

#[cfg(test)]
pub(crate) use signal::pid_alive;
