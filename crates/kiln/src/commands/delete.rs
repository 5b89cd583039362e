use crate::{Cli, provider};
use colored::Colorize;
use kiln_bake::catalogue;

pub async fn handle(cli: &Cli, image_id: &str) -> anyhow::Result<()> {
    let kind = provider::require_provider(cli)?;
    let machine_provider = provider::build(kind, cli, None).await?;

    println!("{}", format!("Deleting {image_id} ...").red());
    catalogue::delete_image(machine_provider.as_ref(), image_id).await?;
    println!("{}", format!("Deleted {image_id}").green());
    Ok(())
}
