use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pageinfra_common::{Config, MarketplaceRegistry, Sku};
use pageinfra_core::{load_registry, Infra, IngestSettings};
use pageinfra_store::{MeilisearchIndex, NoopIndex, PgBackend, SearchIndex};

#[derive(Parser)]
#[command(name = "pageinfra")]
#[command(about = "SKU consistency engine for scraped marketplaces")]
#[command(version)]
struct Cli {
    /// Marketplace table file; overrides PAGEINFRA_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create schemas and tables for every registered marketplace
    Setup,

    /// Print the URLs worth scraping now (claimed and not recently visited)
    FilterUrls {
        #[arg(short, long)]
        marketplace: String,
        /// One URL per line
        file: PathBuf,
    },

    /// Run a JSON-lines file of SKU records through the consistency pipeline
    Ingest {
        #[arg(short, long)]
        marketplace: String,
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record the URLs in a file as scraped now
    MarkScraped {
        #[arg(short, long)]
        marketplace: String,
        file: PathBuf,
    },

    /// List registered marketplaces and their physical names
    Marketplaces,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pageinfra=info".parse()?))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("PAGEINFRA_CONFIG").map(PathBuf::from));
    let registry = load_registry(config_path.as_deref())?;

    // Listing the table needs neither the database nor the search index.
    if let Commands::Marketplaces = cli.command {
        for line in marketplace_lines(&registry) {
            println!("{line}");
        }
        return Ok(());
    }

    let config = Config::from_env()?;
    config.log_redacted();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.batch_concurrency.clamp(4, 64) as u32)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    info!("Connected to database");

    let index: Arc<dyn SearchIndex> = match &config.meilisearch_url {
        Some(url) => Arc::new(MeilisearchIndex::new(url.clone(), config.meilisearch_api_key.clone())),
        None => Arc::new(NoopIndex),
    };
    let infra = Infra::new(
        registry,
        Arc::new(PgBackend::new(pool, index)),
        IngestSettings::from_config(&config),
    );

    match cli.command {
        Commands::Setup => {
            infra.setup().await?;
            println!("{} marketplaces set up", infra.registry().len());
        }
        Commands::FilterUrls { marketplace, file } => {
            let handle = infra.marketplace(&marketplace)?;
            let urls = read_lines(&file)?;
            for url in handle.filter_urls(&urls).await? {
                println!("{url}");
            }
        }
        Commands::Ingest {
            marketplace,
            file,
            json,
        } => {
            let handle = infra.marketplace(&marketplace)?;
            let records = read_records(&file)?;
            let report = handle.ingest(records).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }
        Commands::MarkScraped { marketplace, file } => {
            let handle = infra.marketplace(&marketplace)?;
            let urls = read_lines(&file)?;
            let written = handle.mark_scraped(&urls).await?;
            println!("{written} URLs marked scraped");
        }
        Commands::Marketplaces => {}
    }

    Ok(())
}

fn marketplace_lines(registry: &MarketplaceRegistry) -> Vec<String> {
    registry
        .iter()
        .map(|ns| {
            format!(
                "{}\tdatabase={} sku={} historic={} snapshot={} url={} claim={} index={} queues={},{},{}",
                ns.marketplace,
                ns.database,
                ns.sku_collection,
                ns.historic_collection,
                ns.snapshot_collection,
                ns.url_collection,
                ns.claim_collection,
                ns.catalog_index,
                ns.search_queue,
                ns.sku_queue,
                ns.image_queue,
            )
        })
        .collect()
}

/// Non-empty, trimmed lines; `#` starts a comment line.
fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_lines(&content))
}

fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn read_records(path: &Path) -> Result<Vec<Sku>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_records(&content)
}

/// One record per line. A record without a hash gets one computed from its
/// core fields.
fn parse_records(content: &str) -> Result<Vec<Sku>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| -> Result<Sku> {
            let mut value: serde_json::Value =
                serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", idx + 1))?;
            let code = value
                .get("code")
                .and_then(|c| c.as_str())
                .map(String::from)
                .with_context(|| format!("line {}: missing \"code\"", idx + 1))?;

            let has_hash = value
                .pointer("/metadata/hash")
                .and_then(|h| h.as_str())
                .is_some_and(|h| !h.is_empty());
            if has_hash {
                return serde_json::from_value(value)
                    .with_context(|| format!("line {}: invalid SKU record", idx + 1));
            }

            let core = value.get_mut("core").map(serde_json::Value::take).unwrap_or_default();
            let relatives: Vec<String> = value
                .pointer("/metadata/relatives")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .with_context(|| format!("line {}: invalid relatives", idx + 1))?
                .unwrap_or_default();
            Ok(Sku::new(code, core).with_relatives(relatives))
        })
        .collect()
}
