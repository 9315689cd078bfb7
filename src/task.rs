use crate::catalog::{Key, Schema, SourceCatalog, SourceRecord};
use crate::config::{DeblendParams, SourceDeblendConfig};
use crate::deblend::{DeblendResult, Deblender};
use crate::footprint::Footprint;
use crate::geom::Point2D;
use crate::image::MaskedImage;
use crate::mapper::map_result;
use crate::noise::{estimate_noise, StatisticsControl};
use crate::psf::{psf_fwhm, Psf};
use crate::report::{DeblendReport, SourceOutcome, SourceStatus};
use anyhow::Result;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub const NCHILD_FIELD: &str = "deblend.nchild";
pub const DEBLENDED_AS_PSF_FIELD: &str = "deblend.deblended-as-psf";
pub const PSF_CENTER_FIELD: &str = "deblend.psf-center";
pub const PSF_FLUX_FIELD: &str = "deblend.psf-flux";
pub const TOO_MANY_PEAKS_FIELD: &str = "deblend.too-many-peaks";
pub const FAILED_FIELD: &str = "deblend.failed";
pub const SKIPPED_FIELD: &str = "deblend.skipped";
pub const RAMPED_TEMPLATE_FIELD: &str = "deblend.ramped_template";
pub const PATCHED_TEMPLATE_FIELD: &str = "deblend.patched_template";
pub const HAS_STRAY_FLUX_FIELD: &str = "deblend.has_stray_flux";

/// Catalog fields written by the deblend task
#[derive(Debug, Clone, Copy)]
pub struct DeblendKeys {
    pub n_child: Key<i32>,
    pub deblended_as_psf: Key<bool>,
    pub psf_center: Key<Point2D>,
    pub psf_flux: Key<f64>,
    pub too_many_peaks: Key<bool>,
    pub failed: Key<bool>,
    pub skipped: Key<bool>,
    pub ramped_template: Key<bool>,
    pub patched_template: Key<bool>,
    pub has_stray_flux: Key<bool>,
}

impl DeblendKeys {
    /// Add the deblend fields to `schema`
    pub fn register(schema: &mut Schema) -> Result<Self> {
        let keys = Self {
            n_child: schema.add_field(
                NCHILD_FIELD,
                "Number of children this object has (defaults to 0)",
            )?,
            deblended_as_psf: schema.add_field(
                DEBLENDED_AS_PSF_FIELD,
                "Deblender thought this source looked like a PSF",
            )?,
            psf_center: schema.add_field(PSF_CENTER_FIELD, "If deblended-as-psf, the PSF centroid")?,
            psf_flux: schema.add_field(PSF_FLUX_FIELD, "If deblended-as-psf, the PSF flux")?,
            too_many_peaks: schema.add_field(
                TOO_MANY_PEAKS_FIELD,
                "Source had too many peaks; only the brightest were included",
            )?,
            failed: schema.add_field(FAILED_FIELD, "Deblending failed on source")?,
            skipped: schema.add_field(SKIPPED_FIELD, "Deblender skipped this source")?,
            ramped_template: schema.add_field(
                RAMPED_TEMPLATE_FIELD,
                "This source was near an image edge and the deblender used \"ramp\" edge-handling.",
            )?,
            patched_template: schema.add_field(
                PATCHED_TEMPLATE_FIELD,
                "This source was near an image edge and the deblender used \"patched\" edge-handling.",
            )?,
            has_stray_flux: schema.add_field(
                HAS_STRAY_FLUX_FIELD,
                "This source was assigned some stray flux",
            )?,
        };

        tracing::debug!(
            "Added keys to schema: {}",
            [
                NCHILD_FIELD,
                DEBLENDED_AS_PSF_FIELD,
                PSF_CENTER_FIELD,
                PSF_FLUX_FIELD,
                TOO_MANY_PEAKS_FIELD,
                FAILED_FIELD,
                SKIPPED_FIELD,
                RAMPED_TEMPLATE_FIELD,
                PATCHED_TEMPLATE_FIELD,
                HAS_STRAY_FLUX_FIELD,
            ]
            .join(", ")
        );
        Ok(keys)
    }

    /// Look up the deblend fields in a schema that already has them
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        Ok(Self {
            n_child: schema.find(NCHILD_FIELD)?,
            deblended_as_psf: schema.find(DEBLENDED_AS_PSF_FIELD)?,
            psf_center: schema.find(PSF_CENTER_FIELD)?,
            psf_flux: schema.find(PSF_FLUX_FIELD)?,
            too_many_peaks: schema.find(TOO_MANY_PEAKS_FIELD)?,
            failed: schema.find(FAILED_FIELD)?,
            skipped: schema.find(SKIPPED_FIELD)?,
            ramped_template: schema.find(RAMPED_TEMPLATE_FIELD)?,
            patched_template: schema.find(PATCHED_TEMPLATE_FIELD)?,
            has_stray_flux: schema.find(HAS_STRAY_FLUX_FIELD)?,
        })
    }

    fn indices(&self) -> [usize; 10] {
        [
            self.n_child.index(),
            self.deblended_as_psf.index(),
            self.psf_center.index(),
            self.psf_flux.index(),
            self.too_many_peaks.index(),
            self.failed.index(),
            self.skipped.index(),
            self.ramped_template.index(),
            self.patched_template.index(),
            self.has_stray_flux.index(),
        ]
    }

    /// Fail unless `schema` holds these fields at the same positions
    fn check(&self, schema: &Schema) -> Result<()> {
        let found = Self::from_schema(schema)?;
        if found.indices() != self.indices() {
            return Err(anyhow::anyhow!(
                "Catalog schema does not match the schema the deblend task was built with"
            ));
        }
        Ok(())
    }
}

/// Inputs for one parent, visible to the pre-deblend hook. The hook may
/// adjust `psf_fwhm` and `sigma1` before the deblender sees them.
pub struct PreDeblendContext<'a> {
    pub index: usize,
    pub parent_id: i64,
    pub image: &'a MaskedImage,
    pub footprint: &'a Footprint,
    pub psf: &'a dyn Psf,
    pub psf_fwhm: f64,
    pub sigma1: f64,
}

/// Everything about one successfully deblended parent
pub struct PostDeblendContext<'a> {
    pub index: usize,
    pub parent_id: i64,
    /// Catalog length before this parent's children were appended
    pub npre: usize,
    pub image: &'a MaskedImage,
    pub children: &'a [SourceRecord],
    pub footprint: &'a Footprint,
    pub psf: &'a dyn Psf,
    pub psf_fwhm: f64,
    pub sigma1: f64,
    pub result: &'a DeblendResult,
}

pub type PreDeblendHook = Box<dyn Fn(&mut PreDeblendContext<'_>) + Send + Sync>;
pub type PostDeblendHook = Box<dyn Fn(&PostDeblendContext<'_>) + Send + Sync>;

struct DeblendJob {
    index: usize,
    parent_id: i64,
    npeaks: usize,
    psf_fwhm: f64,
    sigma1: f64,
}

/// Split blended sources into individual sources.
///
/// The task only mutates the catalog in place: flags on parents and new
/// child rows appended at the end. The returned report mirrors what was
/// written.
pub struct SourceDeblendTask {
    config: SourceDeblendConfig,
    keys: DeblendKeys,
    deblender: Box<dyn Deblender>,
    noise_control: StatisticsControl,
    pre_hook: PreDeblendHook,
    post_hook: PostDeblendHook,
}

impl SourceDeblendTask {
    /// Create the task, adding the deblend fields to `schema`
    pub fn new(
        schema: &mut Schema,
        config: SourceDeblendConfig,
        deblender: Box<dyn Deblender>,
    ) -> Result<Self> {
        let keys = DeblendKeys::register(schema)?;
        Ok(Self {
            config,
            keys,
            deblender,
            noise_control: StatisticsControl::default(),
            pre_hook: Box::new(|_| {}),
            post_hook: Box::new(|_| {}),
        })
    }

    /// Called for each parent before the deblender runs
    pub fn with_pre_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PreDeblendContext<'_>) + Send + Sync + 'static,
    {
        self.pre_hook = Box::new(hook);
        self
    }

    /// Called for each successfully deblended parent after its children exist
    pub fn with_post_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PostDeblendContext<'_>) + Send + Sync + 'static,
    {
        self.post_hook = Box::new(hook);
        self
    }

    pub fn with_noise_control(mut self, noise_control: StatisticsControl) -> Self {
        self.noise_control = noise_control;
        self
    }

    pub fn keys(&self) -> &DeblendKeys {
        &self.keys
    }

    /// Deblend every multi-peak source present in `sources` at call time.
    ///
    /// Per-source failures are recorded on the source and in the report;
    /// only structural problems (schema mismatch, unusable variance plane)
    /// fail the run.
    pub fn run(
        &self,
        image: &MaskedImage,
        sources: &mut SourceCatalog,
        psf: &dyn Psf,
    ) -> Result<DeblendReport> {
        self.keys.check(sources.schema())?;

        let n0 = sources.len();
        tracing::info!("Deblending {} sources", n0);

        // find the median stdev in the image
        let sigma1 = estimate_noise(image, &self.noise_control)?;
        tracing::debug!(sigma1, "Noise level from median variance");

        // Bounded by n0: children appended below are never candidates
        let mut jobs = Vec::new();
        for index in 0..n0 {
            let job = {
                let Some(src) = sources.get(index) else {
                    break;
                };
                let footprint = src.footprint();
                let npeaks = footprint.peaks().len();
                if npeaks < 2 {
                    continue;
                }

                let parent_id = src.id();
                tracing::debug!(parent_id, "Parent {}: deblending {} peaks", parent_id, npeaks);

                let mut ctx = PreDeblendContext {
                    index,
                    parent_id,
                    image,
                    footprint,
                    psf,
                    psf_fwhm: psf_fwhm(psf, &footprint.bbox()),
                    sigma1,
                };
                (self.pre_hook)(&mut ctx);

                DeblendJob {
                    index,
                    parent_id,
                    npeaks,
                    psf_fwhm: ctx.psf_fwhm,
                    sigma1: ctx.sigma1,
                }
            };

            // Records the input condition, whatever the deblender does with the cap
            let too_many_peaks = self.config.too_many_peaks(job.npeaks);
            if let Some(src) = sources.get_mut(index) {
                src.set(self.keys.too_many_peaks, too_many_peaks);
            }
            jobs.push(job);
        }

        let params = self.config.params();
        let results: Vec<Result<DeblendResult>> = {
            let catalog: &SourceCatalog = sources;
            let dispatch = |job: &DeblendJob| self.dispatch(job, catalog, image, psf, &params);
            if self.config.parallel {
                jobs.par_iter().map(dispatch).collect()
            } else {
                jobs.iter().map(dispatch).collect()
            }
        };

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (job, result) in jobs.iter().zip(results) {
            let too_many_peaks = self.config.too_many_peaks(job.npeaks);

            let result = match result {
                Ok(result) => {
                    if let Some(src) = sources.get_mut(job.index) {
                        src.set(self.keys.failed, false);
                    }
                    result
                }
                Err(err) => {
                    tracing::warn!(
                        source_id = job.parent_id,
                        "Error deblending source {}: {:?}",
                        job.parent_id,
                        err
                    );
                    if let Some(src) = sources.get_mut(job.index) {
                        src.set(self.keys.failed, true);
                    }
                    outcomes.push(SourceOutcome {
                        index: job.index,
                        parent_id: job.parent_id,
                        npeaks: job.npeaks,
                        too_many_peaks,
                        status: SourceStatus::Failed {
                            cause: format!("{:#}", err),
                        },
                    });
                    continue;
                }
            };

            let peaks = sources
                .get(job.index)
                .map(|src| src.footprint().peaks().to_vec())
                .unwrap_or_default();
            let npre = sources.len();
            let mapped = map_result(sources, job.index, &peaks, &result, &self.keys);
            if let Some(src) = sources.get_mut(job.index) {
                src.set(self.keys.n_child, mapped.nchild as i32);
            }

            let records = sources.records();
            (self.post_hook)(&PostDeblendContext {
                index: job.index,
                parent_id: job.parent_id,
                npre,
                image,
                children: &records[npre..],
                footprint: records[job.index].footprint(),
                psf,
                psf_fwhm: job.psf_fwhm,
                sigma1: job.sigma1,
                result: &result,
            });

            outcomes.push(SourceOutcome {
                index: job.index,
                parent_id: job.parent_id,
                npeaks: job.npeaks,
                too_many_peaks,
                status: SourceStatus::Deblended {
                    nchild: mapped.nchild,
                    skips: mapped.skips,
                },
            });
        }

        let n1 = sources.len();
        let report = DeblendReport {
            n_input: n0,
            n_parents: jobs.len(),
            n_children: n1 - n0,
            n_total: n1,
            sigma1,
            outcomes,
        };
        tracing::info!("{}", report.summary());

        Ok(report)
    }

    /// Run the deblender for one parent; panics are turned into errors
    fn dispatch(
        &self,
        job: &DeblendJob,
        catalog: &SourceCatalog,
        image: &MaskedImage,
        psf: &dyn Psf,
        params: &DeblendParams,
    ) -> Result<DeblendResult> {
        let footprint = catalog
            .get(job.index)
            .map(|src| src.footprint())
            .ok_or_else(|| anyhow::anyhow!("Source {} vanished from catalog", job.parent_id))?;

        catch_unwind(AssertUnwindSafe(|| {
            self.deblender
                .deblend(footprint, image, psf, job.psf_fwhm, job.sigma1, params)
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!(
                "Deblender panicked: {}",
                panic_message(payload.as_ref())
            ))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
