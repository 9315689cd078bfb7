use crate::catalog::SourceCatalog;
use crate::models::{DeblendRun, StoredSource};
use crate::report::DeblendReport;
use crate::task::DeblendKeys;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// SQLite persistence for deblend runs
pub struct Database<'a> {
    conn: &'a Connection,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl<'a> Database<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Database { conn }
    }

    pub fn create_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS deblend_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_at INTEGER NOT NULL,
                    image_path TEXT NOT NULL,
                    catalog_path TEXT NOT NULL,
                    n_input INTEGER NOT NULL,
                    n_parents INTEGER NOT NULL,
                    n_children INTEGER NOT NULL,
                    n_total INTEGER NOT NULL,
                    n_failed INTEGER NOT NULL,
                    sigma1 REAL NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sources (
                    run_id INTEGER NOT NULL REFERENCES deblend_runs(id),
                    source_id INTEGER NOT NULL,
                    parent_id INTEGER,
                    npeaks INTEGER NOT NULL,
                    area INTEGER NOT NULL,
                    nchild INTEGER NOT NULL,
                    deblended_as_psf INTEGER NOT NULL,
                    psf_center_x REAL,
                    psf_center_y REAL,
                    psf_flux REAL,
                    too_many_peaks INTEGER NOT NULL,
                    failed INTEGER NOT NULL,
                    skipped INTEGER NOT NULL,
                    ramped_template INTEGER NOT NULL,
                    patched_template INTEGER NOT NULL,
                    has_stray_flux INTEGER NOT NULL,
                    PRIMARY KEY (run_id, source_id)
                );",
            )
            .context("Failed to create deblend tables")
    }

    /// Record a run summary, returning its row id
    pub fn insert_run(
        &self,
        report: &DeblendReport,
        image_path: &str,
        catalog_path: &str,
    ) -> Result<i64> {
        let run_at = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO deblend_runs
                (run_at, image_path, catalog_path, n_input, n_parents, n_children, n_total, n_failed, sigma1)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_at,
                image_path,
                catalog_path,
                report.n_input as i64,
                report.n_parents as i64,
                report.n_children as i64,
                report.n_total as i64,
                report.n_failed() as i64,
                report.sigma1,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Store every record of `catalog` under `run_id`
    pub fn insert_sources(
        &self,
        run_id: i64,
        catalog: &SourceCatalog,
        keys: &DeblendKeys,
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sources
                    (run_id, source_id, parent_id, npeaks, area, nchild, deblended_as_psf,
                     psf_center_x, psf_center_y, psf_flux, too_many_peaks, failed, skipped,
                     ramped_template, patched_template, has_stray_flux)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;

            for record in catalog.iter() {
                let center = record.get(keys.psf_center);
                stmt.execute(params![
                    run_id,
                    record.id(),
                    record.parent(),
                    record.footprint().peaks().len() as i64,
                    record.footprint().area() as i64,
                    record.get(keys.n_child),
                    record.get(keys.deblended_as_psf),
                    finite(center.x),
                    finite(center.y),
                    finite(record.get(keys.psf_flux)),
                    record.get(keys.too_many_peaks),
                    record.get(keys.failed),
                    record.get(keys.skipped),
                    record.get(keys.ramped_template),
                    record.get(keys.patched_template),
                    record.get(keys.has_stray_flux),
                ])
                .with_context(|| format!("Failed to store source {}", record.id()))?;
            }
        }
        tx.commit()?;

        tracing::debug!(run_id, "Stored {} sources", catalog.len());
        Ok(catalog.len())
    }

    /// Summary row plus every source for one run
    pub fn save_run(
        &self,
        report: &DeblendReport,
        catalog: &SourceCatalog,
        keys: &DeblendKeys,
        image_path: &str,
        catalog_path: &str,
    ) -> Result<i64> {
        self.create_tables()?;
        let run_id = self.insert_run(report, image_path, catalog_path)?;
        self.insert_sources(run_id, catalog, keys)?;
        Ok(run_id)
    }

    pub fn get_runs(&self) -> Result<Vec<DeblendRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_at, image_path, catalog_path, n_input, n_parents, n_children,
                    n_total, n_failed, sigma1
             FROM deblend_runs
             ORDER BY id",
        )?;

        let runs = stmt
            .query_map([], |row| {
                Ok(DeblendRun {
                    id: row.get(0)?,
                    run_at: row.get(1)?,
                    image_path: row.get(2)?,
                    catalog_path: row.get(3)?,
                    n_input: row.get(4)?,
                    n_parents: row.get(5)?,
                    n_children: row.get(6)?,
                    n_total: row.get(7)?,
                    n_failed: row.get(8)?,
                    sigma1: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    pub fn get_sources(&self, run_id: i64) -> Result<Vec<StoredSource>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, source_id, parent_id, npeaks, area, nchild, deblended_as_psf,
                    psf_center_x, psf_center_y, psf_flux, too_many_peaks, failed, skipped,
                    ramped_template, patched_template, has_stray_flux
             FROM sources
             WHERE run_id = ?
             ORDER BY source_id",
        )?;

        let sources = stmt
            .query_map([run_id], |row| {
                Ok(StoredSource {
                    run_id: row.get(0)?,
                    source_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    npeaks: row.get(3)?,
                    area: row.get(4)?,
                    nchild: row.get(5)?,
                    deblended_as_psf: row.get(6)?,
                    psf_center_x: row.get(7)?,
                    psf_center_y: row.get(8)?,
                    psf_flux: row.get(9)?,
                    too_many_peaks: row.get(10)?,
                    failed: row.get(11)?,
                    skipped: row.get(12)?,
                    ramped_template: row.get(13)?,
                    patched_template: row.get(14)?,
                    has_stray_flux: row.get(15)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sources)
    }
}
