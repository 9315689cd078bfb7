/// Point-spread-function models as seen by the deblender.
///
/// Only the second-moment shape is needed here: the deblender receives the
/// PSF object itself and the orchestrator derives a characteristic width.
use crate::geom::{BoundingBox, Point2D};
use serde::{Deserialize, Serialize};

/// Sigma to FWHM conversion used for the deblender's PSF width
pub const SIGMA_TO_FWHM: f64 = 2.35;

/// Second moments of a 2-D light distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quadrupole {
    pub ixx: f64,
    pub iyy: f64,
    pub ixy: f64,
}

impl Quadrupole {
    pub fn new(ixx: f64, iyy: f64, ixy: f64) -> Self {
        Self { ixx, iyy, ixy }
    }

    /// Radius defined by the fourth root of the moment-matrix determinant.
    /// Equals sigma for a circular Gaussian.
    pub fn determinant_radius(&self) -> f64 {
        let det = self.ixx * self.iyy - self.ixy * self.ixy;
        det.max(0.0).sqrt().sqrt()
    }
}

/// PSF model queried by the orchestrator and handed to the deblender
pub trait Psf: Send + Sync {
    /// Second-moment shape of the PSF at a position
    fn compute_shape(&self, position: Point2D) -> Quadrupole;
}

/// Elliptical Gaussian PSF, constant across the image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPsf {
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Rotation angle in radians
    #[serde(default)]
    pub theta: f64,
}

impl GaussianPsf {
    pub fn circular(sigma: f64) -> Self {
        Self {
            sigma_x: sigma,
            sigma_y: sigma,
            theta: 0.0,
        }
    }
}

impl Psf for GaussianPsf {
    fn compute_shape(&self, _position: Point2D) -> Quadrupole {
        let (sin_t, cos_t) = self.theta.sin_cos();
        let sx2 = self.sigma_x * self.sigma_x;
        let sy2 = self.sigma_y * self.sigma_y;
        Quadrupole {
            ixx: sx2 * cos_t * cos_t + sy2 * sin_t * sin_t,
            iyy: sx2 * sin_t * sin_t + sy2 * cos_t * cos_t,
            ixy: (sx2 - sy2) * sin_t * cos_t,
        }
    }
}

/// Characteristic PSF width for a footprint: 2.35 × determinant radius,
/// evaluated at the footprint's bounding-box centre
pub fn psf_fwhm(psf: &dyn Psf, bbox: &BoundingBox) -> f64 {
    psf.compute_shape(bbox.center()).determinant_radius() * SIGMA_TO_FWHM
}
