use crate::catalog::SourceCatalog;
use crate::deblend::DeblendResult;
use crate::footprint::Peak;
use crate::task::DeblendKeys;
use serde::Serialize;

/// Why a peak produced no child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSkipReason {
    /// The routine flagged the peak as skipped (e.g. out of bounds)
    Skipped,
    /// No flux portion was produced (e.g. beyond the peak cap)
    NoFluxPortion,
}

/// A peak that did not become a child
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakSkip {
    pub peak_index: usize,
    /// Peak position, when the outcome lines up with a known peak
    pub position: Option<(i32, i32)>,
    pub reason: PeakSkipReason,
}

/// What mapping one parent's result produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappedChildren {
    pub nchild: usize,
    /// Every skipped peak, in peak order
    pub skips: Vec<PeakSkip>,
}

/// Turn one parent's per-peak outcomes into child records.
///
/// Children are appended to `catalog`. The parent's `deblend.skipped` flag
/// is written for every examined peak, so with mixed outcomes it ends up
/// reflecting the last peak; `skips` keeps the per-peak detail. The caller
/// writes `deblend.nchild`.
pub fn map_result(
    catalog: &mut SourceCatalog,
    parent_index: usize,
    peaks: &[Peak],
    result: &DeblendResult,
    keys: &DeblendKeys,
) -> MappedChildren {
    let mut mapped = MappedChildren::default();
    let Some(parent_id) = catalog.get(parent_index).map(|p| p.id()) else {
        return mapped;
    };

    for (j, outcome) in result.peaks.iter().enumerate() {
        let position = peaks.get(j).map(|p| (p.x, p.y));

        let flux_portion = match &outcome.flux_portion {
            Some(flux_portion) if !outcome.skip => flux_portion,
            _ => {
                let reason = if outcome.skip {
                    tracing::debug!(
                        parent_id,
                        peak = j,
                        "Skipping out-of-bounds peak at {:?}",
                        position
                    );
                    PeakSkipReason::Skipped
                } else {
                    tracing::debug!(
                        parent_id,
                        peak = j,
                        "Skipping peak at {:?}, child {} of {}: no flux portion",
                        position,
                        j + 1,
                        result.peaks.len()
                    );
                    PeakSkipReason::NoFluxPortion
                };
                set_skipped(catalog, parent_index, keys, true);
                mapped.skips.push(PeakSkip {
                    peak_index: j,
                    position,
                    reason,
                });
                continue;
            }
        };

        set_skipped(catalog, parent_index, keys, false);

        let child = catalog.add_new();
        mapped.nchild += 1;
        child.set_parent(parent_id);
        child.set_footprint(flux_portion.clone());
        child.set(keys.deblended_as_psf, outcome.deblended_as_psf);
        child.set(keys.has_stray_flux, outcome.stray_flux.is_some());
        if outcome.deblended_as_psf {
            child.set(keys.psf_center, outcome.psf_fit_center);
            child.set(keys.psf_flux, outcome.psf_fit_flux);
        }
        child.set(keys.ramped_template, outcome.has_ramped_template);
        child.set(keys.patched_template, outcome.patched);
    }

    mapped
}

fn set_skipped(catalog: &mut SourceCatalog, parent_index: usize, keys: &DeblendKeys, value: bool) {
    if let Some(parent) = catalog.get_mut(parent_index) {
        parent.set(keys.skipped, value);
    }
}
