use crate::baseline::NearestPeakDeblender;
use crate::catalog::{Schema, SourceCatalog};
use crate::config::{EdgeHandling, SourceDeblendConfig};
use crate::db::Database;
use crate::image::MaskedImage;
use crate::psf::GaussianPsf;
use crate::report::{DeblendReport, SourceStatus};
use crate::task::SourceDeblendTask;
use crate::utils::deblended_path;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

pub struct DeblendOptions {
    pub image: String,
    pub catalog: String,
    pub psf_sigma: f64,
    pub config: Option<String>,
    pub output: Option<String>,
    pub database: Option<String>,
    pub report: Option<String>,
    pub parallel: bool,
    pub max_peaks: Option<i32>,
    pub edge_handling: Option<EdgeHandling>,
    pub variance: Option<f32>,
}

/// Load the config file (if any) and apply command-line overrides
pub fn resolve_config(opts: &DeblendOptions) -> Result<SourceDeblendConfig> {
    let mut config = match &opts.config {
        Some(path) => SourceDeblendConfig::from_json_file(Path::new(path))?,
        None => SourceDeblendConfig::default(),
    };

    if opts.parallel {
        config.parallel = true;
    }
    if let Some(max_peaks) = opts.max_peaks {
        config.max_number_of_peaks = max_peaks;
    }
    if let Some(edge_handling) = opts.edge_handling {
        config.edge_handling = edge_handling;
    }
    Ok(config)
}

pub fn deblend_sources(opts: DeblendOptions) -> Result<()> {
    if !(opts.psf_sigma.is_finite() && opts.psf_sigma > 0.0) {
        return Err(anyhow::anyhow!(
            "PSF sigma must be positive, got {}",
            opts.psf_sigma
        ));
    }

    let config = resolve_config(&opts)?;
    tracing::debug!("Deblend config: {:?}", config);

    let image = MaskedImage::from_fits(Path::new(&opts.image), opts.variance)?;
    tracing::info!(
        "Loaded {}x{} image from {}",
        image.width(),
        image.height(),
        opts.image
    );

    let mut schema = Schema::new();
    let task = SourceDeblendTask::new(&mut schema, config, Box::new(NearestPeakDeblender))?;
    let mut catalog = SourceCatalog::load_json(schema, Path::new(&opts.catalog))?;
    let psf = GaussianPsf::circular(opts.psf_sigma);

    let report = task.run(&image, &mut catalog, &psf)?;
    print_summary(&report);

    let output = opts
        .output
        .clone()
        .unwrap_or_else(|| deblended_path(&opts.catalog));
    catalog.save_json(Path::new(&output))?;
    println!("Catalog written to {}", output);

    if let Some(report_path) = &opts.report {
        let text = serde_json::to_string_pretty(&report)?;
        std::fs::write(report_path, text)
            .with_context(|| format!("Failed to write report: {}", report_path))?;
        println!("Report written to {}", report_path);
    }

    if let Some(db_path) = &opts.database {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        let db = Database::new(&conn);
        let run_id = db.save_run(&report, &catalog, task.keys(), &opts.image, &output)?;
        println!("Recorded run {} in {}", run_id, db_path);
    }

    Ok(())
}

fn print_summary(report: &DeblendReport) {
    println!("{}", report.summary());
    println!("Noise level (sigma1): {:.4}", report.sigma1);

    let too_many = report.outcomes.iter().filter(|o| o.too_many_peaks).count();
    if too_many > 0 {
        println!("Sources over the peak cap: {}", too_many);
    }

    if report.n_failed() > 0 {
        println!("\nFailed sources: {}", report.n_failed());
        for outcome in report.failures() {
            if let SourceStatus::Failed { cause } = &outcome.status {
                println!("  {:<10} {}", outcome.parent_id, cause);
            }
        }
    }
}
