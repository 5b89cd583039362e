use crate::{Cli, provider};
use colored::Colorize;
use kiln_bake::Baker;
use kiln_config::ImageSpec;
use kiln_remote::{ExecutorConfig, SshExecutor};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub async fn handle(cli: &Cli, spec_path: &Path) -> anyhow::Result<()> {
    let spec = match ImageSpec::load(spec_path) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("{}", format!("Invalid spec: {e}").red());
            std::process::exit(2);
        }
    };

    println!(
        "{}",
        format!("Baking '{}' on {}", spec.name, spec.provider).blue()
    );

    let machine_provider = provider::build(spec.provider, cli, Some(&spec)).await?;
    let executor = Arc::new(SshExecutor::new(ExecutorConfig::default()));

    // First Ctrl-C flips the flag; the orchestrator notices at the next
    // step boundary and routes the build into cleanup.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", "Interrupt received, cleaning up...".yellow());
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match Baker::new(machine_provider, executor, spec)
        .with_cancel_flag(cancel)
        .run()
        .await
    {
        Ok(image) => {
            println!(
                "{}",
                format!("Image '{}' ({}) is ready", image.name, image.id)
                    .green()
                    .bold()
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", err.to_string().red());
            if let Some(cleanup) = err.cleanup_error() {
                eprintln!(
                    "{}",
                    format!("Resources needing manual removal: {cleanup}").yellow()
                );
            }
            std::process::exit(err.exit_code());
        }
    }
}
