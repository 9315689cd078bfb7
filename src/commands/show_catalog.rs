use crate::catalog::{Schema, SourceCatalog, SourceRecord};
use crate::task::DeblendKeys;
use anyhow::{Context, Result};
use std::path::Path;

pub fn show_catalog(catalog_path: &str, format: &str, parents_only: bool) -> Result<()> {
    let catalog = SourceCatalog::load_json(Schema::new(), Path::new(catalog_path))?;
    let keys = DeblendKeys::from_schema(catalog.schema())
        .with_context(|| format!("{} has no deblend fields; run `deblend` first", catalog_path))?;

    let records: Vec<&SourceRecord> = catalog
        .iter()
        .filter(|r| !parents_only || r.get(keys.n_child) > 0)
        .collect();

    match format {
        "json" => output_json(&records, &keys)?,
        "csv" => output_csv(&records, &keys),
        _ => output_table(&records, &keys),
    }

    Ok(())
}

/// Compact flag column: F failed, S skipped, T too many peaks, P deblended
/// as PSF, R ramped, E patched edge, X stray flux
pub fn flag_string(record: &SourceRecord, keys: &DeblendKeys) -> String {
    [
        (keys.failed, 'F'),
        (keys.skipped, 'S'),
        (keys.too_many_peaks, 'T'),
        (keys.deblended_as_psf, 'P'),
        (keys.ramped_template, 'R'),
        (keys.patched_template, 'E'),
        (keys.has_stray_flux, 'X'),
    ]
    .iter()
    .filter(|(key, _)| record.get(*key))
    .map(|(_, c)| *c)
    .collect()
}

fn fmt_opt(value: f64, precision: usize) -> String {
    if value.is_finite() {
        format!("{:.*}", precision, value)
    } else {
        String::new()
    }
}

fn output_table(records: &[&SourceRecord], keys: &DeblendKeys) {
    println!(
        "{:<10} {:<10} {:<6} {:<8} {:<7} {:<8} {:<12} {:<20}",
        "ID", "Parent", "Peaks", "Area", "NChild", "Flags", "PSF Flux", "PSF Center"
    );
    println!("{:-<90}", "");

    for record in records {
        let center = record.get(keys.psf_center);
        let center_str = if center.x.is_finite() && center.y.is_finite() {
            format!("({:.2}, {:.2})", center.x, center.y)
        } else {
            String::new()
        };

        println!(
            "{:<10} {:<10} {:<6} {:<8} {:<7} {:<8} {:<12} {:<20}",
            record.id(),
            record
                .parent()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.footprint().peaks().len(),
            record.footprint().area(),
            record.get(keys.n_child),
            flag_string(record, keys),
            fmt_opt(record.get(keys.psf_flux), 2),
            center_str
        );
    }

    println!("\nTotal: {} sources", records.len());
}

fn output_json(records: &[&SourceRecord], keys: &DeblendKeys) -> Result<()> {
    let json_records: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let center = record.get(keys.psf_center);
            let flux = record.get(keys.psf_flux);
            serde_json::json!({
                "id": record.id(),
                "parent": record.parent(),
                "npeaks": record.footprint().peaks().len(),
                "area": record.footprint().area(),
                "nchild": record.get(keys.n_child),
                "failed": record.get(keys.failed),
                "skipped": record.get(keys.skipped),
                "too_many_peaks": record.get(keys.too_many_peaks),
                "deblended_as_psf": record.get(keys.deblended_as_psf),
                "psf_center": center.x.is_finite().then_some([center.x, center.y]),
                "psf_flux": flux.is_finite().then_some(flux),
                "ramped_template": record.get(keys.ramped_template),
                "patched_template": record.get(keys.patched_template),
                "has_stray_flux": record.get(keys.has_stray_flux),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_records)?);
    Ok(())
}

fn output_csv(records: &[&SourceRecord], keys: &DeblendKeys) {
    println!("id,parent,npeaks,area,nchild,flags,psf_flux,psf_center_x,psf_center_y");

    for record in records {
        let center = record.get(keys.psf_center);
        println!(
            "{},{},{},{},{},{},{},{},{}",
            record.id(),
            record.parent().map(|p| p.to_string()).unwrap_or_default(),
            record.footprint().peaks().len(),
            record.footprint().area(),
            record.get(keys.n_child),
            flag_string(record, keys),
            fmt_opt(record.get(keys.psf_flux), 6),
            fmt_opt(center.x, 6),
            fmt_opt(center.y, 6)
        );
    }
}
