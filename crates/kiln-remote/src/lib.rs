//! Remote command execution for kiln builds
//!
//! Once a provider has a machine on the network, this crate takes over:
//! wait for SSH with bounded retry, push the spec's uploads, then run the
//! provisioning commands strictly in order with output streamed line by
//! line as it is produced. The first nonzero exit stops the run.

pub mod error;
pub mod executor;
pub mod stream;
pub mod wait;

pub use error::{RemoteError, Result};
pub use executor::{ExecutorConfig, RemoteExecutor, SshExecutor};
pub use stream::{CommandOutcome, OutputLine, RunningCommand};
pub use wait::wait_until;
