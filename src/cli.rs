use crate::config::EdgeHandling;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blend-split")]
#[command(about = "Split blended detections in a source catalog into individual sources", long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deblend every multi-peak source in a catalog
    Deblend {
        /// FITS image (IMAGE/MASK/VARIANCE extensions, or a single image HDU)
        image: String,

        /// Catalog JSON with footprints and peaks
        catalog: String,

        /// Sigma of the circular Gaussian PSF, in pixels
        #[arg(long)]
        psf_sigma: f64,

        /// Deblend configuration JSON
        #[arg(short, long)]
        config: Option<String>,

        /// Where to write the updated catalog (default: <catalog>.deblended.json)
        #[arg(short, long)]
        output: Option<String>,

        /// Also record the run in this SQLite database
        #[arg(short, long)]
        database: Option<String>,

        /// Write the per-source report as JSON
        #[arg(long)]
        report: Option<String>,

        /// Deblend sources on all cores
        #[arg(long)]
        parallel: bool,

        /// Only deblend the brightest N peaks of each source (<= 0: unlimited)
        #[arg(long)]
        max_peaks: Option<i32>,

        /// Edge handling: clip, ramp or noclip
        #[arg(long)]
        edge_handling: Option<EdgeHandling>,

        /// Constant variance to use when the FITS file has no VARIANCE extension
        #[arg(long)]
        variance: Option<f32>,
    },

    /// Print the sources of a catalog with their deblend fields
    ShowCatalog {
        /// Catalog JSON
        catalog: String,

        /// Output format (json, csv, table)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Only show sources that were split
        #[arg(long)]
        parents_only: bool,
    },

    /// List deblend runs recorded in a database
    ListRuns {
        /// SQLite database written by `deblend --database`
        database: String,

        /// Show the sources stored for this run instead of the run list
        #[arg(long)]
        run: Option<i64>,
    },
}
