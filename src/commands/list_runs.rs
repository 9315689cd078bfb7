use crate::db::Database;
use crate::models::StoredSource;
use crate::utils::{format_timestamp, truncate_string};
use anyhow::Result;
use rusqlite::Connection;

pub fn list_runs(conn: &Connection, run: Option<i64>) -> Result<()> {
    let db = Database::new(conn);
    if let Some(run_id) = run {
        let sources = db.get_sources(run_id)?;
        if sources.is_empty() {
            return Err(anyhow::anyhow!("No sources stored for run {}", run_id));
        }
        output_sources(run_id, &sources);
        return Ok(());
    }

    let runs = db.get_runs()?;

    println!(
        "{:<6} {:<20} {:<30} {:<8} {:<8} {:<9} {:<8} {:<7} {:<8}",
        "ID", "Date", "Image", "Input", "Parents", "Children", "Total", "Failed", "Sigma"
    );
    println!("{:-<110}", "");

    for run in &runs {
        println!(
            "{:<6} {:<20} {:<30} {:<8} {:<8} {:<9} {:<8} {:<7} {:<8.3}",
            run.id,
            format_timestamp(run.run_at),
            truncate_string(&run.image_path, 30),
            run.n_input,
            run.n_parents,
            run.n_children,
            run.n_total,
            run.n_failed,
            run.sigma1
        );
    }

    println!("\nTotal: {} runs", runs.len());
    Ok(())
}

fn output_sources(run_id: i64, sources: &[StoredSource]) {
    println!("Run {}", run_id);
    println!(
        "{:<10} {:<10} {:<6} {:<8} {:<7} {:<7} {:<8} {:<12}",
        "ID", "Parent", "Peaks", "Area", "NChild", "Failed", "Skipped", "PSF Flux"
    );
    println!("{:-<80}", "");

    for source in sources {
        println!(
            "{:<10} {:<10} {:<6} {:<8} {:<7} {:<7} {:<8} {:<12}",
            source.source_id,
            source
                .parent_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            source.npeaks,
            source.area,
            source.nchild,
            if source.failed { "yes" } else { "" },
            if source.skipped { "yes" } else { "" },
            source
                .psf_flux
                .map(|f| format!("{:.2}", f))
                .unwrap_or_default()
        );
    }

    println!("\nTotal: {} sources", sources.len());
}
