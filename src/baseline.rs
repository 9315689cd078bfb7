use crate::config::DeblendParams;
use crate::deblend::{DeblendResult, Deblender, PeakOutcome};
use crate::footprint::{Footprint, Peak};
use crate::image::MaskedImage;
use crate::psf::Psf;
use anyhow::Result;

/// Stray flux starts this many PSF widths away from every peak
const STRAY_RADIUS_FWHM: f64 = 2.0;

type PixelList = Vec<(i32, i32, f32)>;

/// Splits a footprint by giving each pixel to its nearest peak.
///
/// No templates are built: a peak's flux portion is simply the footprint
/// pixels closer to it than to any other processed peak. Distance ties go
/// to the brighter peak, then to the earlier one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestPeakDeblender;

impl Deblender for NearestPeakDeblender {
    fn deblend(
        &self,
        footprint: &Footprint,
        image: &MaskedImage,
        _psf: &dyn Psf,
        psf_fwhm: f64,
        _sigma1: f64,
        params: &DeblendParams,
    ) -> Result<DeblendResult> {
        if footprint.is_empty() {
            return Err(anyhow::anyhow!("Cannot deblend an empty footprint"));
        }

        let peaks = footprint.peaks();
        let bbox = footprint.bbox();
        let tiny = params.tiny_footprint_size;
        if tiny > 0 && (bbox.width < tiny || bbox.height < tiny) {
            tracing::debug!(
                "Footprint {}x{} is tiny; skipping {} peaks",
                bbox.width,
                bbox.height,
                peaks.len()
            );
            return Ok(DeblendResult::new(
                peaks.iter().map(|_| PeakOutcome::skipped()).collect(),
            ));
        }

        let limit = params
            .peak_limit()
            .map_or(peaks.len(), |n| n.min(peaks.len()));

        // Peaks past the cap keep a default outcome: not skipped, no flux
        let mut outcomes: Vec<PeakOutcome> = peaks
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i < limit && !image.contains(p.x, p.y) {
                    PeakOutcome::skipped()
                } else {
                    PeakOutcome::default()
                }
            })
            .collect();

        let active: Vec<usize> = (0..limit).filter(|&i| !outcomes[i].skip).collect();
        if active.is_empty() {
            return Ok(DeblendResult::new(outcomes));
        }

        let total_flux: f64 = footprint
            .pixels()
            .filter_map(|(x, y)| image.pixel(x, y))
            .map(|v| v as f64)
            .sum();
        let stray_radius = STRAY_RADIUS_FWHM * psf_fwhm;
        let stray_floor = params.clip_stray_flux_fraction * total_flux.abs();

        let mut owned: Vec<PixelList> = vec![Vec::new(); peaks.len()];
        let mut stray: Vec<PixelList> = vec![Vec::new(); peaks.len()];
        for (x, y) in footprint.pixels() {
            let Some(value) = image.pixel(x, y) else {
                continue;
            };
            let (nearest, distance) = nearest_peak(peaks, &active, x, y);

            if params.find_stray_flux && distance > stray_radius {
                if (value as f64).abs() >= stray_floor {
                    stray[nearest].push((x, y, value));
                }
                continue;
            }
            owned[nearest].push((x, y, value));
        }

        for &i in &active {
            let pixels = std::mem::take(&mut owned[i]);
            if pixels.is_empty() {
                continue;
            }

            let touches_edge = pixels.iter().any(|&(x, y, _)| image.is_edge_pixel(x, y));
            let outcome = &mut outcomes[i];
            if touches_edge {
                if params.ramp_flux_at_edge {
                    outcome.has_ramped_template = true;
                } else if params.patch_edges {
                    outcome.patched = true;
                }
            }

            outcome.flux_portion = Some(heavy_footprint(pixels, peaks[i])?);

            let stray_pixels = std::mem::take(&mut stray[i]);
            if params.assign_stray_flux && !stray_pixels.is_empty() {
                outcome.stray_flux = Some(heavy_footprint(stray_pixels, peaks[i])?);
            }
        }

        Ok(DeblendResult::new(outcomes))
    }
}

/// Index of the closest active peak and its distance
fn nearest_peak(peaks: &[Peak], active: &[usize], x: i32, y: i32) -> (usize, f64) {
    let mut best = active[0];
    let mut best_d2 = i64::MAX;
    for &i in active {
        let p = peaks[i];
        let dx = (x - p.x) as i64;
        let dy = (y - p.y) as i64;
        let d2 = dx * dx + dy * dy;
        if d2 < best_d2 || (d2 == best_d2 && p.value > peaks[best].value) {
            best = i;
            best_d2 = d2;
        }
    }
    (best, (best_d2 as f64).sqrt())
}

fn heavy_footprint(mut pixels: PixelList, peak: Peak) -> Result<Footprint> {
    pixels.sort_by_key(|&(x, y, _)| (y, x));
    pixels.dedup_by_key(|&mut (x, y, _)| (x, y));
    let coords: Vec<(i32, i32)> = pixels.iter().map(|&(x, y, _)| (x, y)).collect();
    let flux: Vec<f32> = pixels.iter().map(|&(_, _, v)| v).collect();
    Footprint::from_pixels(&coords, vec![peak]).with_flux(flux)
}
