use anyhow::Context;
use blend_split::cli::{Cli, Commands};
use blend_split::commands::{deblend_sources, list_runs, show_catalog, DeblendOptions};
use clap::Parser;
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "blend_split=debug"
    } else {
        "blend_split=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Deblend {
            image,
            catalog,
            psf_sigma,
            config,
            output,
            database,
            report,
            parallel,
            max_peaks,
            edge_handling,
            variance,
        } => {
            deblend_sources(DeblendOptions {
                image,
                catalog,
                psf_sigma,
                config,
                output,
                database,
                report,
                parallel,
                max_peaks,
                edge_handling,
                variance,
            })?;
        }
        Commands::ShowCatalog {
            catalog,
            format,
            parents_only,
        } => {
            show_catalog(&catalog, &format, parents_only)?;
        }
        Commands::ListRuns { database, run } => {
            let conn = Connection::open(&database)
                .with_context(|| format!("Failed to open database: {}", database))?;
            list_runs(&conn, run)?;
        }
    }

    Ok(())
}
