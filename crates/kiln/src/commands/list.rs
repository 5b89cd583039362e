use crate::{Cli, provider};
use colored::Colorize;
use kiln_bake::catalogue;

pub async fn handle(cli: &Cli) -> anyhow::Result<()> {
    let kind = provider::require_provider(cli)?;
    let machine_provider = provider::build(kind, cli, None).await?;

    let images = catalogue::list_images(machine_provider.as_ref()).await?;
    if images.is_empty() {
        println!("No images found on {kind}");
        return Ok(());
    }

    println!(
        "{:<24} {:<28} {}",
        "ID".bold(),
        "NAME".bold(),
        "CREATED".bold()
    );
    for image in images {
        println!(
            "{:<24} {:<28} {}",
            image.id.cyan(),
            image.name,
            image.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
