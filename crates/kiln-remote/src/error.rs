//! Remote execution error types

use crate::stream::CommandOutcome;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Could not reach {what} within {waited_secs}s")]
    ConnectTimeout { what: String, waited_secs: u64 },

    #[error("Command '{command}' exited with code {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        /// Everything the command wrote before failing.
        output: String,
        /// Outcomes of the commands that ran before this one, in order.
        completed: Vec<CommandOutcome>,
    },

    #[error("Upload of '{src}' to '{dest}' failed: {reason}")]
    Upload {
        src: String,
        dest: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;
