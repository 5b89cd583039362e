//! Bake state machine states

/// Where a bake currently is.
///
/// The happy path walks the states in declaration order; `Failed` absorbs
/// from any non-terminal state, always after passing through `CleaningUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeState {
    Pending,
    Validating,
    Provisioning,
    AwaitingNetwork,
    Configuring,
    Capturing,
    CleaningUp,
    Done,
    Failed,
}

impl BakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BakeState::Done | BakeState::Failed)
    }
}

impl std::fmt::Display for BakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BakeState::Pending => "pending",
            BakeState::Validating => "validating",
            BakeState::Provisioning => "provisioning",
            BakeState::AwaitingNetwork => "awaiting-network",
            BakeState::Configuring => "configuring",
            BakeState::Capturing => "capturing",
            BakeState::CleaningUp => "cleaning-up",
            BakeState::Done => "done",
            BakeState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
