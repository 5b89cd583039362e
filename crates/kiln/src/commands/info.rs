use crate::{Cli, provider};
use colored::Colorize;
use kiln_bake::catalogue;
use std::collections::BTreeMap;

pub async fn handle(cli: &Cli, image_id: &str) -> anyhow::Result<()> {
    let kind = provider::require_provider(cli)?;
    let machine_provider = provider::build(kind, cli, None).await?;

    let image = catalogue::image_info(machine_provider.as_ref(), image_id).await?;

    println!("{} {}", "id:".bold(), image.id.cyan());
    println!("{} {}", "name:".bold(), image.name);
    if !image.description.is_empty() {
        println!("{} {}", "description:".bold(), image.description);
    }
    println!(
        "{} {}",
        "created:".bold(),
        image.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    // HashMap iteration order is arbitrary; sort for stable output
    let metadata: BTreeMap<_, _> = image.metadata.iter().collect();
    for (key, value) in metadata {
        println!("{} {}", format!("{key}:").bold(), value);
    }
    Ok(())
}
