use serde::{Deserialize, Serialize};

/// One row of the `deblend_runs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeblendRun {
    pub id: i64,
    /// Unix timestamp (seconds, UTC)
    pub run_at: i64,
    pub image_path: String,
    pub catalog_path: String,
    pub n_input: i64,
    pub n_parents: i64,
    pub n_children: i64,
    pub n_total: i64,
    pub n_failed: i64,
    pub sigma1: f64,
}

/// One row of the `sources` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSource {
    pub run_id: i64,
    pub source_id: i64,
    pub parent_id: Option<i64>,
    pub npeaks: i64,
    pub area: i64,
    pub nchild: i32,
    pub deblended_as_psf: bool,
    pub psf_center_x: Option<f64>,
    pub psf_center_y: Option<f64>,
    pub psf_flux: Option<f64>,
    pub too_many_peaks: bool,
    pub failed: bool,
    pub skipped: bool,
    pub ramped_template: bool,
    pub patched_template: bool,
    pub has_stray_flux: bool,
}
