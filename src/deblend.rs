//! Contract between the orchestrator and a pixel-level deblend routine
use crate::config::DeblendParams;
use crate::footprint::Footprint;
use crate::geom::Point2D;
use crate::image::MaskedImage;
use crate::psf::Psf;
use anyhow::Result;

/// What the routine decided for one peak of the parent footprint
#[derive(Debug, Clone)]
pub struct PeakOutcome {
    /// The routine declined to materialize this peak (e.g. out of bounds)
    pub skip: bool,
    /// Heavy footprint holding this peak's share of the flux. `None` happens
    /// for peaks beyond the configured cap even when `skip` is false.
    pub flux_portion: Option<Footprint>,
    /// The peak looked like a point source
    pub deblended_as_psf: bool,
    /// PSF fit centre; meaningful only when `deblended_as_psf`
    pub psf_fit_center: Point2D,
    /// PSF fit flux; meaningful only when `deblended_as_psf`
    pub psf_fit_flux: f64,
    /// Template near the image edge was ramped down using the PSF
    pub has_ramped_template: bool,
    /// Template near the image edge was patched (edge ignored)
    pub patched: bool,
    /// Stray flux attributed to this peak, if any was found
    pub stray_flux: Option<Footprint>,
}

impl Default for PeakOutcome {
    fn default() -> Self {
        Self {
            skip: false,
            flux_portion: None,
            deblended_as_psf: false,
            psf_fit_center: Point2D::origin(),
            psf_fit_flux: 0.0,
            has_ramped_template: false,
            patched: false,
            stray_flux: None,
        }
    }
}

impl PeakOutcome {
    pub fn skipped() -> Self {
        Self {
            skip: true,
            ..Default::default()
        }
    }

    pub fn with_flux(flux_portion: Footprint) -> Self {
        Self {
            flux_portion: Some(flux_portion),
            ..Default::default()
        }
    }

    /// Whether this outcome produces a child record
    pub fn yields_child(&self) -> bool {
        !self.skip && self.flux_portion.is_some()
    }
}

/// Per-peak outcomes, index-aligned with the parent's peak list
#[derive(Debug, Clone, Default)]
pub struct DeblendResult {
    pub peaks: Vec<PeakOutcome>,
}

impl DeblendResult {
    pub fn new(peaks: Vec<PeakOutcome>) -> Self {
        Self { peaks }
    }

    /// Number of children this result will create
    pub fn child_count(&self) -> usize {
        self.peaks.iter().filter(|p| p.yields_child()).count()
    }
}

/// Pixel-level deblend routine.
///
/// Implementations must be callable concurrently from several threads with
/// shared, read-only image and PSF. Any `Err` is contained to the parent it
/// was raised for.
pub trait Deblender: Send + Sync {
    fn deblend(
        &self,
        footprint: &Footprint,
        image: &MaskedImage,
        psf: &dyn Psf,
        psf_fwhm: f64,
        sigma1: f64,
        params: &DeblendParams,
    ) -> Result<DeblendResult>;
}
