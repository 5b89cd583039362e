//! Streamed command output
//!
//! A spawned command's stdout and stderr are read line by line on their own
//! tasks and funneled into one channel. [`RunningCommand`] is the pull side:
//! callers take lines as they are produced and collect the exit status at
//! the end, so output shows up in near real time without tying the executor
//! to any particular sink.

use crate::error::{RemoteError, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// One line of command output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Exit status and captured output of one executed command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command in flight.
///
/// `next_line` yields output as it arrives and returns `None` once both
/// streams hit EOF; `finish` drains whatever is left and waits for the
/// exit status. Lines are also captured so the full output travels with
/// the [`CommandOutcome`] (and with a failure report).
pub struct RunningCommand {
    command: String,
    child: Child,
    lines: mpsc::Receiver<OutputLine>,
    captured: String,
}

impl RunningCommand {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next output line, in production order. `None` at EOF.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        let line = self.lines.recv().await?;
        self.captured.push_str(line.text());
        self.captured.push('\n');
        Some(line)
    }

    /// Drain remaining output and collect the exit status.
    pub async fn finish(mut self) -> Result<CommandOutcome> {
        while self.next_line().await.is_some() {}
        let status = self.child.wait().await?;
        Ok(CommandOutcome {
            command: self.command,
            exit_code: status.code().unwrap_or(-1),
            output: self.captured,
        })
    }
}

/// Spawn `cmd` with piped output and start the reader tasks.
pub(crate) fn spawn_streaming(mut cmd: Command, command_text: &str) -> Result<RunningCommand> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RemoteError::Io(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RemoteError::Io(std::io::Error::other("stderr not captured")))?;

    let (tx, rx) = mpsc::channel(256);
    let tx_err = tx.clone();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine::Stdout(line)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_err.send(OutputLine::Stderr(line)).await.is_err() {
                break;
            }
        }
    });

    Ok(RunningCommand {
        command: command_text.to_string(),
        child,
        lines: rx,
        captured: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_streams_both_channels_and_exit_code() {
        let run = spawn_streaming(sh("echo out-line; echo err-line >&2; exit 3"), "demo").unwrap();

        let outcome = run.finish().await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
        assert!(outcome.output.contains("out-line"));
        assert!(outcome.output.contains("err-line"));
    }

    #[tokio::test]
    async fn test_lines_arrive_tagged_and_in_order() {
        let mut run = spawn_streaming(sh("echo one; echo two"), "demo").unwrap();

        let mut stdout_lines = Vec::new();
        while let Some(line) = run.next_line().await {
            if let OutputLine::Stdout(l) = line {
                stdout_lines.push(l);
            }
        }
        assert_eq!(stdout_lines, vec!["one", "two"]);

        let outcome = run.finish().await.unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_finish_without_pulling_still_captures() {
        let run = spawn_streaming(sh("echo hello"), "demo").unwrap();
        let outcome = run.finish().await.unwrap();
        assert_eq!(outcome.output, "hello\n");
    }
}
