use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use slow_eumetsat::config::Settings;
use slow_eumetsat::eumetsat::{Credentials, ProductId};
use slow_eumetsat::logging::Logger;
use slow_eumetsat::store::MetadataStore;
use slow_eumetsat::DownloadManager;
use std::path::PathBuf;
use tracing::instrument::WithSubscriber;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Scheduled downloads of EUMETSAT Data Store products")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = "./inputs/settings.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and record every dataset in the window that is not already stored
    Download {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Defaults to the product in the settings file
        #[arg(long)]
        product: Option<String>,
    },
    /// List the datasets in the window and what a download would do with each
    Plan {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        product: Option<String>,
        #[arg(long, default_value = "./outputs/download_plan.json")]
        output: PathBuf,
    },
    /// Print the metadata store as a markdown table
    Metadata,
    /// Write the default settings file
    Template {
        #[arg(long, default_value = "./inputs/settings.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Template { output } = &cli.command {
        let settings = Settings::from_template(&Settings::template())?;
        settings.write(output)?;
        println!("Settings written to {}", output.display());
        return Ok(());
    }

    let settings = Settings::read(&cli.config)
        .with_context(|| format!("Unable to read settings from {}", cli.config.display()))?;

    match cli.command {
        Command::Download {
            start,
            end,
            product,
        } => {
            let product = product.map(ProductId::new).unwrap_or(settings.product_id.clone());
            let logger = Logger::new(&settings.log)?;
            let dispatch = logger.dispatch().clone();
            let mut manager =
                DownloadManager::from_settings(&settings, Credentials::from_env()?, logger.clone())
                    .await?;

            let mut events = manager.subscribe();
            let reporter = tokio::spawn(
                async move {
                    while let Some(event) = events.recv().await {
                        info!(
                            "[{}/{}] {} {:?}",
                            event.position, event.total, event.dataset_id, event.state
                        );
                    }
                }
                .with_subscriber(dispatch),
            );

            let result = manager.run(&start, &end, &product).await;
            drop(manager);
            reporter.await?;

            let summary = result?;
            if !summary.is_complete() {
                logger.in_scope(|| {
                    for (id, reason) in &summary.failed {
                        warn!("{id}: {reason}");
                    }
                });
                bail!("{} of {} datasets failed", summary.failed.len(), summary.discovered);
            }
        }
        Command::Plan {
            start,
            end,
            product,
            output,
        } => {
            let product = product.map(ProductId::new).unwrap_or(settings.product_id.clone());
            let logger = Logger::new(&settings.log)?;
            let manager =
                DownloadManager::from_settings(&settings, Credentials::from_env()?, logger).await?;

            let plan = manager.plan(&start, &end, &product).await?;
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            plan.write(&output)?;
            println!(
                "{} datasets found, {} to download. Plan written to {}",
                plan.tasks().len(),
                plan.pending().count(),
                output.display()
            );
        }
        Command::Metadata => {
            let store = MetadataStore::open(&settings.metadata_db)?;
            println!("{}", store.to_markdown()?);
        }
        Command::Template { .. } => {}
    }

    Ok(())
}
