use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use soletrace_harvest::{
    merge_links, BrandRegistry, HarvestConfig, HarvestPipeline, ProxySource, DEFAULT_PAGE_COUNT,
};
use soletrace_storage::ArtifactStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "soletrace")]
#[command(about = "Sneaker market harvester: listing pages, product details, sales activity")]
struct Cli {
    /// Brand slug to harvest; defaults to every enabled brand in the registry.
    #[arg(long, global = true)]
    brand: Option<String>,
    /// Brand registry file.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    /// Artifact root directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Load proxies from a local host:port file instead of the provider page.
    #[arg(long, global = true)]
    proxies_file: Option<PathBuf>,
    /// Bounded worker pool size.
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Browse-page count for the links phase.
    #[arg(long, global = true)]
    pages: Option<u32>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest brand browse pages into per-page link rows.
    Links,
    /// Harvest product detail documents for every known link.
    Details,
    /// Harvest sales activity for every product with a detail document.
    Transactions,
    /// Run the three phases in order and write a run report.
    All,
    /// Rebuild the flattened per-brand links export from the page rows.
    MergeLinks,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = HarvestConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(path) = cli.proxies_file {
        config.proxy_source = ProxySource::File(path);
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers.max(1);
    }
    let registry_path = cli.registry.unwrap_or_else(|| config.registry_path.clone());

    // Named brand runs work without a registry file; harvesting "everything
    // enabled" needs one.
    let registry = if registry_path.is_file() {
        Some(BrandRegistry::load(&registry_path)?)
    } else {
        None
    };
    let brands: Vec<(String, u32)> = match &cli.brand {
        Some(slug) => {
            let configured_pages = registry
                .as_ref()
                .and_then(|r| r.find(slug))
                .and_then(|b| b.pages);
            vec![(
                slug.clone(),
                cli.pages.or(configured_pages).unwrap_or(DEFAULT_PAGE_COUNT),
            )]
        }
        None => {
            let Some(registry) = &registry else {
                bail!(
                    "no registry at {} and no --brand given",
                    registry_path.display()
                );
            };
            registry
                .enabled()
                .map(|b| (b.slug.clone(), cli.pages.or(b.pages).unwrap_or(DEFAULT_PAGE_COUNT)))
                .collect()
        }
    };
    if brands.is_empty() {
        bail!("no enabled brands in {}", registry_path.display());
    }

    let command = cli.command.unwrap_or(Commands::All);
    if let Commands::MergeLinks = command {
        // export rebuild is local work; no proxies, no network
        let store = ArtifactStore::new(config.data_dir.clone());
        for (brand, _) in &brands {
            let path = merge_links(&store, brand).await?;
            println!("merged links for {brand}: {}", path.display());
        }
        return Ok(());
    }

    let pipeline = HarvestPipeline::bootstrap(config).await?;
    for (brand, pages) in &brands {
        info!(brand = %brand, "harvest starting");
        match command {
            Commands::Links => {
                let summary = pipeline.run_links_phase(brand, *pages).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Commands::Details => {
                let summary = pipeline.run_detail_phase(brand).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Commands::Transactions => {
                let summary = pipeline.run_transactions_phase(brand).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Commands::All => {
                let summary = pipeline.run_all(brand, *pages).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Commands::MergeLinks => unreachable!("handled before bootstrap"),
        }
    }

    Ok(())
}
