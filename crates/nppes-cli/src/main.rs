use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use nppes_sync::IngestConfig;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "nppes-cli")]
#[command(about = "Ingest NPPES provider data into the provider directory")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Locate, fetch and ingest the newest dissemination archive.
    Ingest(IngestArgs),
    /// Apply the bundled database migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct IngestArgs {
    /// Archive URL; skips scraping the index page.
    #[arg(long)]
    url: Option<String>,
    /// Local archive path; an existing file there is used without downloading.
    #[arg(long)]
    zip: Option<PathBuf>,
    /// Stop after reading this many data rows; 0 reads them all.
    #[arg(long)]
    limit: Option<u64>,
    /// Keep providers in memory instead of writing to the database.
    #[arg(long)]
    dry_run: bool,
    /// YAML file overriding the archive layout rules.
    #[arg(long)]
    layout: Option<PathBuf>,
}

impl IngestArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(url) = &self.url {
            config.source_url = Some(url.clone());
        }
        if let Some(zip) = &self.zip {
            config.archive_path = Some(zip.clone());
        }
        if let Some(layout) = &self.layout {
            config.layout_file = Some(layout.clone());
        }
        config.limit = self.limit;
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = IngestConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => {
            args.apply(&mut config);
            let summary = nppes_sync::run_ingest(config, args.dry_run).await?;
            let c = summary.counters;
            println!(
                "ingest complete: run_id={} processed={} created={} updated={} skipped={} errors={} report={}",
                summary.run.id,
                c.processed,
                c.created,
                c.updated,
                c.skipped,
                c.error_count,
                summary.report_path.display()
            );
        }
        Commands::Migrate => {
            nppes_sync::run_migrations(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{err:#}"), "ingest failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment_config() {
        let cli = Cli::parse_from([
            "nppes-cli",
            "ingest",
            "--url",
            "https://mirror.example/nppes.zip",
            "--zip",
            "/tmp/nppes.zip",
            "--limit",
            "1000",
            "--dry-run",
        ]);
        let Some(Commands::Ingest(args)) = cli.command else {
            panic!("expected ingest command");
        };
        assert!(args.dry_run);

        let mut config = IngestConfig::default();
        args.apply(&mut config);
        assert_eq!(config.source_url.as_deref(), Some("https://mirror.example/nppes.zip"));
        assert_eq!(config.archive_path(), PathBuf::from("/tmp/nppes.zip"));
        assert_eq!(config.limit, Some(1000));
        assert!(config.layout_file.is_none());
    }

    #[test]
    fn bare_invocation_defaults_to_ingest() {
        let cli = Cli::parse_from(["nppes-cli"]);
        assert!(cli.command.is_none());
    }
}
