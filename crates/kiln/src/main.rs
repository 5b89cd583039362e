mod commands;
mod provider;

use clap::{Parser, Subcommand};
use kiln_config::ProviderKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(about = "Bake machine images on EC2, OpenStack or local KVM", long_about = None)]
struct Cli {
    /// Backend for catalogue commands (bake takes it from the spec)
    #[arg(long, global = true, env = "KILN_PROVIDER")]
    provider: Option<ProviderKind>,

    /// EC2 region (overrides the spec's region)
    #[arg(long, global = true, env = "AWS_DEFAULT_REGION")]
    region: Option<String>,

    /// libvirt connection URI (overrides the spec's region field)
    #[arg(long, global = true, env = "LIBVIRT_DEFAULT_URI")]
    uri: Option<String>,

    /// Directory holding libvirt images
    #[arg(long, global = true, default_value = kiln_cloud_libvirt::DEFAULT_IMAGE_DIR)]
    image_dir: PathBuf,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a spec file
    Bake {
        /// Path to the image spec (.json, .yaml or .yml)
        spec: PathBuf,
    },
    /// List baked images, oldest first
    List,
    /// Show details of one image
    Info {
        /// Image id (AMI id, Glance id, or libvirt file stem)
        image_id: String,
    },
    /// Delete an image from the catalogue
    Delete {
        /// Image id (AMI id, Glance id, or libvirt file stem)
        image_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match &cli.command {
        Commands::Bake { spec } => commands::bake::handle(&cli, spec).await,
        Commands::List => commands::list::handle(&cli).await,
        Commands::Info { image_id } => commands::info::handle(&cli, image_id).await,
        Commands::Delete { image_id } => commands::delete::handle(&cli, image_id).await,
    }
}
