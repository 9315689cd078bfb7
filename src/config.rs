use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do when a peak is close to the image edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeHandling {
    /// Clip the template at the edge AND the mirror of the edge
    Clip,
    /// Ramp down flux at the image edge by the PSF
    #[default]
    Ramp,
    /// Ignore the edge when building the symmetric template
    NoClip,
}

impl std::str::FromStr for EdgeHandling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clip" => Ok(EdgeHandling::Clip),
            "ramp" => Ok(EdgeHandling::Ramp),
            "noclip" | "no-clip" => Ok(EdgeHandling::NoClip),
            _ => Err(format!(
                "Unknown edge handling: {}. Use clip, ramp or noclip",
                s
            )),
        }
    }
}

/// When stray flux may be attributed to point-source children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrayFluxToPointSources {
    /// When there is not an extended object in the footprint
    #[default]
    Necessary,
    Always,
    /// Stray flux is never given to a child if every peak looks like a point source
    Never,
}

impl std::str::FromStr for StrayFluxToPointSources {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "necessary" => Ok(StrayFluxToPointSources::Necessary),
            "always" => Ok(StrayFluxToPointSources::Always),
            "never" => Ok(StrayFluxToPointSources::Never),
            _ => Err(format!(
                "Unknown stray flux policy: {}. Use necessary, always or never",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDeblendConfig {
    pub edge_handling: EdgeHandling,
    pub stray_flux_to_point_sources: StrayFluxToPointSources,

    /// Find stray flux (flux not claimed by any child)
    pub find_stray_flux: bool,
    /// Assign stray flux to children; implies `find_stray_flux`
    pub assign_stray_flux: bool,
    /// Stray flux fractions below this value are clipped to zero
    pub clip_stray_flux_fraction: f64,

    /// Chi-squared per DOF cut for the un-shifted PSF model
    pub psf_chisq1: f64,
    /// Chi-squared per DOF cut for the shifted PSF model
    pub psf_chisq2: f64,
    /// Chi-squared per DOF cut for the second shifted PSF model
    pub psf_chisq2b: f64,

    /// Only deblend the brightest N peaks of a parent (<= 0: unlimited)
    pub max_number_of_peaks: i32,
    /// Footprints narrower or shorter than this are ignored (0: never)
    pub tiny_footprint_size: i32,

    /// Dispatch candidates on the rayon thread pool
    pub parallel: bool,
}

impl Default for SourceDeblendConfig {
    fn default() -> Self {
        Self {
            edge_handling: EdgeHandling::Ramp,
            stray_flux_to_point_sources: StrayFluxToPointSources::Necessary,
            find_stray_flux: true,
            assign_stray_flux: true,
            clip_stray_flux_fraction: 0.001,
            psf_chisq1: 1.5,
            psf_chisq2: 1.5,
            psf_chisq2b: 1.5,
            max_number_of_peaks: 0,
            tiny_footprint_size: 2,
            parallel: false,
        }
    }
}

impl SourceDeblendConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Whether a parent with `npeaks` peaks gets the too-many-peaks flag.
    /// The comparison is against the raw cap, so a cap of 0 flags every parent.
    pub fn too_many_peaks(&self, npeaks: usize) -> bool {
        npeaks as i64 > self.max_number_of_peaks as i64
    }

    /// Arguments handed to the deblend routine
    pub fn params(&self) -> DeblendParams {
        DeblendParams {
            psf_chisq_cut1: self.psf_chisq1,
            psf_chisq_cut2: self.psf_chisq2,
            psf_chisq_cut2b: self.psf_chisq2b,
            max_number_of_peaks: self.max_number_of_peaks,
            stray_flux_to_point_sources: self.stray_flux_to_point_sources,
            assign_stray_flux: self.assign_stray_flux,
            find_stray_flux: self.assign_stray_flux || self.find_stray_flux,
            ramp_flux_at_edge: self.edge_handling == EdgeHandling::Ramp,
            patch_edges: self.edge_handling == EdgeHandling::NoClip,
            tiny_footprint_size: self.tiny_footprint_size,
            clip_stray_flux_fraction: self.clip_stray_flux_fraction,
        }
    }
}

/// Knobs the deblend routine receives for every parent
#[derive(Debug, Clone, PartialEq)]
pub struct DeblendParams {
    pub psf_chisq_cut1: f64,
    pub psf_chisq_cut2: f64,
    pub psf_chisq_cut2b: f64,
    pub max_number_of_peaks: i32,
    pub stray_flux_to_point_sources: StrayFluxToPointSources,
    pub assign_stray_flux: bool,
    pub find_stray_flux: bool,
    pub ramp_flux_at_edge: bool,
    pub patch_edges: bool,
    pub tiny_footprint_size: i32,
    pub clip_stray_flux_fraction: f64,
}

impl DeblendParams {
    /// Number of peaks the routine may process, `None` when unlimited
    pub fn peak_limit(&self) -> Option<usize> {
        if self.max_number_of_peaks > 0 {
            Some(self.max_number_of_peaks as usize)
        } else {
            None
        }
    }
}
