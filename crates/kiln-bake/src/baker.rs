//! The bake orchestrator
//!
//! One [`Baker`] run drives the whole state machine:
//!
//! ```text
//! pending -> validating -> provisioning -> awaiting-network
//!         -> configuring -> capturing -> cleaning-up -> done
//! ```
//!
//! with `failed` absorbing from any non-terminal state, always via
//! `cleaning-up`. The provisioning-through-capture phase is one inner
//! future whose result is captured before `release_all` runs, so teardown
//! happens exactly once on every path out — normal completion, propagated
//! error, or Ctrl-C between steps.

use crate::error::{BakeError, PhaseError};
use crate::session::BakeSession;
use crate::state::BakeState;
use kiln_cloud::{Image, MachineProvider, WaitPolicy};
use kiln_config::ImageSpec;
use kiln_remote::{RemoteError, RemoteExecutor};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Baker {
    provider: Arc<dyn MachineProvider>,
    executor: Arc<dyn RemoteExecutor>,
    spec: ImageSpec,
    wait: WaitPolicy,
    /// Set from the outside (Ctrl-C handler); checked between steps only,
    /// never inside an in-flight provider call.
    cancel: Arc<AtomicBool>,
}

impl Baker {
    pub fn new(
        provider: Arc<dyn MachineProvider>,
        executor: Arc<dyn RemoteExecutor>,
        spec: ImageSpec,
    ) -> Self {
        Self {
            provider,
            executor,
            spec,
            wait: WaitPolicy::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait = policy;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Run the bake to a terminal state and return the captured image.
    pub async fn run(self) -> Result<Image, BakeError> {
        let mut session = BakeSession::new();

        session.transition(BakeState::Validating);
        self.validate().await?;

        let phase = self.build_phase(&mut session).await;

        session.transition(BakeState::CleaningUp);
        let cleanup = session.tracker.release_all(self.provider.as_ref()).await;

        match (phase, cleanup) {
            (Ok(image), Ok(())) => {
                session.transition(BakeState::Done);
                tracing::info!("Image '{}' ({}) is ready", image.name, image.id);
                Ok(image)
            }
            (Ok(image), Err(cleanup)) => {
                session.transition(BakeState::Failed);
                Err(BakeError::CleanupOnly { image, cleanup })
            }
            (Err(phase), cleanup) => {
                session.transition(BakeState::Failed);
                Err(phase.into_bake(cleanup.err()))
            }
        }
    }

    /// Name-uniqueness check; runs before any resource exists, so a
    /// failure here needs no cleanup.
    async fn validate(&self) -> Result<(), BakeError> {
        let images = self.provider.list_images().await.map_err(|e| {
            BakeError::Validation(format!("could not check existing images: {e}"))
        })?;

        if images.iter().any(|i| i.name == self.spec.name) {
            return Err(BakeError::Validation(format!(
                "an image named '{}' already exists on {}",
                self.spec.name,
                self.provider.name()
            )));
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), PhaseError> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::warn!("Interrupt received, heading to cleanup");
            Err(PhaseError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn build_phase(&self, session: &mut BakeSession) -> Result<Image, PhaseError> {
        self.checkpoint()?;
        session.transition(BakeState::Provisioning);
        let machine = self
            .provider
            .provision(&self.spec, &mut session.tracker)
            .await
            .map_err(PhaseError::Provision)?;

        self.checkpoint()?;
        session.transition(BakeState::AwaitingNetwork);
        let endpoint = self
            .provider
            .wait_for_endpoint(&machine, &self.spec, &self.wait)
            .await
            .map_err(|e| PhaseError::Network(e.to_string()))?;
        self.executor.wait_ready(&endpoint).await.map_err(|e| match e {
            RemoteError::ConnectTimeout { .. } => PhaseError::Network(e.to_string()),
            other => PhaseError::Command(other),
        })?;
        session.endpoint = Some(endpoint.clone());

        self.checkpoint()?;
        session.transition(BakeState::Configuring);
        self.executor
            .upload(&endpoint, &self.spec.uploads)
            .await
            .map_err(PhaseError::Command)?;
        self.executor
            .run_commands(&endpoint, &self.spec.commands)
            .await
            .map_err(PhaseError::Command)?;
        if self.spec.sysprep {
            tracing::info!("Scrubbing guest state before capture");
            self.executor
                .run_commands(&endpoint, &sysprep_commands(&self.spec.user))
                .await
                .map_err(PhaseError::Command)?;
        }

        self.checkpoint()?;
        session.transition(BakeState::Capturing);
        let image = self
            .provider
            .capture(&machine, &self.spec)
            .await
            .map_err(PhaseError::Capture)?;
        Ok(image)
    }
}

/// Scrub commands run before capture when the spec opts into `sysprep`,
/// so clones of the image boot as fresh machines.
fn sysprep_commands(user: &str) -> Vec<String> {
    vec![
        "sudo rm -f /etc/ssh/ssh_host_*".into(),
        "sudo truncate -s 0 /etc/machine-id".into(),
        "sudo rm -f /var/lib/dbus/machine-id".into(),
        "sudo cloud-init clean --logs 2>/dev/null || true".into(),
        "sudo rm -rf /tmp/* /var/tmp/*".into(),
        "sudo rm -f /root/.bash_history".into(),
        format!("rm -f /home/{user}/.bash_history"),
        "sudo find /var/log -type f -exec truncate -s 0 {} \\;".into(),
        "sudo rm -f /etc/udev/rules.d/70-persistent-net.rules".into(),
        "sync".into(),
    ]
}
