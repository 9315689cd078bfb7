//! End-to-end runs of the deblend task against scripted deblenders

use crate::baseline::NearestPeakDeblender;
use crate::catalog::{Schema, SourceCatalog};
use crate::config::{DeblendParams, SourceDeblendConfig};
use crate::deblend::{DeblendResult, Deblender, PeakOutcome};
use crate::footprint::{Footprint, Peak};
use crate::geom::Point2D;
use crate::image::MaskedImage;
use crate::mapper::PeakSkipReason;
use crate::noise::StatisticsControl;
use crate::psf::{GaussianPsf, Psf, SIGMA_TO_FWHM};
use crate::report::{DeblendReport, SourceStatus};
use crate::task::SourceDeblendTask;
use anyhow::Result;
use rand::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const WIDTH: usize = 128;
const HEIGHT: usize = 10;
const SLOT: i32 = 8;
const PSF_SIGMA: f64 = 1.5;

type Script = Box<dyn Fn(&Footprint) -> Result<DeblendResult> + Send + Sync>;

/// Inputs one deblender call received: (slot, psf_fwhm, sigma1)
type Seen = Arc<Mutex<Vec<(i32, f64, f64)>>>;

struct ScriptedDeblender {
    script: Script,
    calls: Arc<AtomicUsize>,
    seen: Seen,
}

impl Deblender for ScriptedDeblender {
    fn deblend(
        &self,
        footprint: &Footprint,
        _image: &MaskedImage,
        _psf: &dyn Psf,
        psf_fwhm: f64,
        sigma1: f64,
        _params: &DeblendParams,
    ) -> Result<DeblendResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((slot_of(footprint), psf_fwhm, sigma1));
        (self.script)(footprint)
    }
}

struct Recorder {
    calls: Arc<AtomicUsize>,
    seen: Seen,
}

impl Recorder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<(i32, f64, f64)> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_by_key(|s| s.0);
        seen
    }
}

fn scripted<F>(script: F) -> (Box<dyn Deblender>, Recorder)
where
    F: Fn(&Footprint) -> Result<DeblendResult> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let deblender = ScriptedDeblender {
        script: Box::new(script),
        calls: calls.clone(),
        seen: seen.clone(),
    };
    (Box::new(deblender), Recorder { calls, seen })
}

/// Catalog position a test footprint was built for
fn slot_of(footprint: &Footprint) -> i32 {
    footprint.bbox().x0 / SLOT
}

fn noisy_image() -> MaskedImage {
    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<f32> = (0..WIDTH * HEIGHT)
        .map(|_| 100.0 + rng.gen::<f32>() * 10.0)
        .collect();
    MaskedImage::with_constant_variance(WIDTH, HEIGHT, data, 4.0).unwrap()
}

fn psf() -> GaussianPsf {
    GaussianPsf::circular(PSF_SIGMA)
}

/// A 6x5 block in its own slot with `npeaks` peaks along the middle row,
/// brightest first, clear of the image edges
fn blend(slot: i32, npeaks: usize) -> Footprint {
    let x0 = slot * SLOT + 1;
    let pixels: Vec<(i32, i32)> = (2..=6)
        .flat_map(|y| (x0..x0 + 6).map(move |x| (x, y)))
        .collect();
    let peaks = (0..npeaks)
        .map(|k| Peak::new(x0 + k as i32, 4, 50.0 - k as f32))
        .collect();
    Footprint::from_pixels(&pixels, peaks)
}

fn setup(
    config: SourceDeblendConfig,
    deblender: Box<dyn Deblender>,
    peak_counts: &[usize],
) -> (SourceDeblendTask, SourceCatalog) {
    let mut schema = Schema::new();
    let task = SourceDeblendTask::new(&mut schema, config, deblender).unwrap();
    let mut catalog = SourceCatalog::new(schema);
    for (slot, &npeaks) in peak_counts.iter().enumerate() {
        catalog
            .add_new()
            .set_footprint(blend(slot as i32, npeaks));
    }
    (task, catalog)
}

fn point_portion(peak: &Peak) -> Result<Footprint> {
    Footprint::from_pixels(&[(peak.x, peak.y)], vec![*peak]).with_flux(vec![peak.value])
}

fn one_child_per_peak(footprint: &Footprint) -> Result<DeblendResult> {
    let peaks = footprint
        .peaks()
        .iter()
        .map(|p| Ok(PeakOutcome::with_flux(point_portion(p)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(DeblendResult::new(peaks))
}

fn capped(max_number_of_peaks: i32) -> SourceDeblendConfig {
    SourceDeblendConfig {
        max_number_of_peaks,
        ..Default::default()
    }
}

fn run(task: &SourceDeblendTask, catalog: &mut SourceCatalog) -> DeblendReport {
    task.run(&noisy_image(), catalog, &psf()).unwrap()
}

#[test]
fn test_sources_with_fewer_than_two_peaks_are_left_alone() {
    let (deblender, recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[0, 1, 2, 1]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    assert_eq!(recorder.calls(), 1);
    assert_eq!(report.n_parents, 1);
    for index in [0, 1, 3] {
        let src = catalog.get(index).unwrap();
        assert_eq!(src.get(keys.n_child), 0);
        assert!(!src.get(keys.failed));
        assert!(!src.get(keys.skipped));
        assert!(!src.get(keys.too_many_peaks));
        assert_eq!(catalog.children_of(src.id()).count(), 0);
    }
    assert!(report.outcome_for(1).is_none());
}

#[test]
fn test_nchild_counts_only_materialized_peaks() {
    let (deblender, _recorder) = scripted(|fp: &Footprint| {
        let mut result = one_child_per_peak(fp)?;
        for (j, outcome) in result.peaks.iter_mut().enumerate() {
            match j {
                1 => *outcome = PeakOutcome::skipped(),
                3 => outcome.flux_portion = None,
                _ => {}
            }
        }
        Ok(result)
    });
    let (task, mut catalog) = setup(capped(8), deblender, &[4, 2, 3]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    let nchild: Vec<i32> = (0..3)
        .map(|i| catalog.get(i).unwrap().get(keys.n_child))
        .collect();
    assert_eq!(nchild, vec![2, 1, 2]);
    assert_eq!(catalog.len(), 3 + 5);
    assert_eq!(report.n_children, 5);

    let outcome = report.outcome_for(1).unwrap();
    let SourceStatus::Deblended { nchild, skips } = &outcome.status else {
        panic!("source 1 should have been deblended");
    };
    assert_eq!(*nchild, 2);
    let reasons: Vec<_> = skips.iter().map(|s| (s.peak_index, s.reason)).collect();
    assert_eq!(
        reasons,
        vec![(1, PeakSkipReason::Skipped), (3, PeakSkipReason::NoFluxPortion)]
    );
}

#[test]
fn test_children_link_to_parent_with_fresh_ids() {
    let (deblender, _recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[2]);
    catalog
        .add_with_id(50, None, blend(1, 3))
        .unwrap();
    let max_pre_id = catalog.iter().map(|r| r.id()).max().unwrap();

    run(&task, &mut catalog);

    let children = &catalog.records()[2..];
    assert_eq!(children.len(), 5);
    assert!(children.iter().all(|c| c.id() > max_pre_id));
    assert_eq!(catalog.children_of(1).count(), 2);
    assert_eq!(catalog.children_of(50).count(), 3);
    for child in catalog.children_of(50) {
        assert!(child.footprint().is_heavy());
        assert_eq!(child.footprint().peaks()[0].x, child.footprint().bbox().x0);
    }
}

#[test]
fn test_appended_children_are_not_revisited() {
    // Every child carries the parent's full peak list, so it would be a
    // candidate itself if the loop ever reached it
    let (deblender, recorder) = scripted(|fp: &Footprint| {
        let portion = Footprint::from_pixels(&[(fp.bbox().x0, 3)], fp.peaks().to_vec())
            .with_flux(vec![1.0])?;
        Ok(DeblendResult::new(
            fp.peaks()
                .iter()
                .map(|_| PeakOutcome::with_flux(portion.clone()))
                .collect(),
        ))
    });
    let (task, mut catalog) = setup(capped(8), deblender, &[2, 3]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    assert_eq!(recorder.calls(), 2);
    assert_eq!(report.n_parents, 2);
    assert_eq!(catalog.len(), 2 + 5);
    for child in &catalog.records()[2..] {
        assert!(child.footprint().peaks().len() >= 2);
        assert_eq!(child.get(keys.n_child), 0);
        assert_eq!(catalog.children_of(child.id()).count(), 0);
    }
}

#[test]
fn test_failure_is_contained_to_its_source() {
    let (deblender, recorder) = scripted(|fp: &Footprint| match slot_of(fp) {
        1 => Err(anyhow::anyhow!("boom in slot 1")),
        2 => panic!("routine blew up"),
        _ => one_child_per_peak(fp),
    });
    let (task, mut catalog) = setup(capped(8), deblender, &[2, 2, 2, 2]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    assert_eq!(recorder.calls(), 4);
    for index in [0, 3] {
        let src = catalog.get(index).unwrap();
        assert!(!src.get(keys.failed));
        assert_eq!(src.get(keys.n_child), 2);
    }
    for index in [1, 2] {
        let src = catalog.get(index).unwrap();
        assert!(src.get(keys.failed));
        assert_eq!(src.get(keys.n_child), 0);
        assert_eq!(catalog.children_of(src.id()).count(), 0);
    }

    assert_eq!(report.n_failed(), 2);
    assert_eq!(report.n_parents, 4);
    assert_eq!(report.n_children, 4);
    let failed: Vec<i64> = report.failures().map(|o| o.parent_id).collect();
    assert_eq!(failed, vec![2, 3]);

    let causes: Vec<String> = report
        .failures()
        .map(|o| match &o.status {
            SourceStatus::Failed { cause } => cause.clone(),
            SourceStatus::Deblended { .. } => String::new(),
        })
        .collect();
    assert!(causes[0].contains("boom in slot 1"));
    assert!(causes[1].contains("routine blew up"));
}

#[test]
fn test_psf_fields_only_for_point_sources() {
    let (deblender, _recorder) = scripted(|fp: &Footprint| {
        let mut result = one_child_per_peak(fp)?;
        let star = &mut result.peaks[0];
        star.deblended_as_psf = true;
        star.psf_fit_center = Point2D::new(2.25, 4.5);
        star.psf_fit_flux = 1234.0;

        let galaxy = &mut result.peaks[1];
        galaxy.psf_fit_center = Point2D::new(-1.0, -1.0);
        galaxy.psf_fit_flux = 99.0;
        Ok(result)
    });
    let (task, mut catalog) = setup(capped(8), deblender, &[2]);
    let keys = *task.keys();

    run(&task, &mut catalog);

    let star = catalog.get(1).unwrap();
    assert!(star.get(keys.deblended_as_psf));
    assert_eq!(star.get(keys.psf_center), Point2D::new(2.25, 4.5));
    assert_eq!(star.get(keys.psf_flux), 1234.0);

    let galaxy = catalog.get(2).unwrap();
    assert!(!galaxy.get(keys.deblended_as_psf));
    assert!(galaxy.get(keys.psf_flux).is_nan());
    assert!(galaxy.get(keys.psf_center).x.is_nan());

    // Unset values stay out of the serialized rows
    let rows = catalog.to_rows();
    assert!(rows[1].fields.contains_key("deblend.psf-flux"));
    assert!(!rows[2].fields.contains_key("deblend.psf-flux"));
}

#[test]
fn test_two_clean_peaks_make_two_children() {
    let config = SourceDeblendConfig {
        find_stray_flux: false,
        assign_stray_flux: false,
        ..capped(4)
    };
    let (task, mut catalog) = setup(config, Box::new(NearestPeakDeblender), &[2]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    assert_eq!(catalog.len(), 3);
    let parent = catalog.get(0).unwrap();
    assert_eq!(parent.get(keys.n_child), 2);
    assert!(!parent.get(keys.failed));
    assert!(!parent.get(keys.skipped));
    assert!(!parent.get(keys.too_many_peaks));

    for child in &catalog.records()[1..] {
        assert_eq!(child.parent(), Some(parent.id()));
        assert!(!child.get(keys.deblended_as_psf));
        assert!(!child.get(keys.has_stray_flux));
        assert!(!child.get(keys.ramped_template));
        assert!(!child.get(keys.patched_template));
    }
    let split: usize = catalog.records()[1..]
        .iter()
        .map(|c| c.footprint().area())
        .sum();
    assert_eq!(split, parent.footprint().area());
    assert_eq!(report.n_failed(), 0);
}

#[test]
fn test_three_peaks_capped_at_two() {
    let (task, mut catalog) = setup(capped(2), Box::new(NearestPeakDeblender), &[3]);
    let keys = *task.keys();

    let report = run(&task, &mut catalog);

    assert_eq!(catalog.len(), 3);
    let parent = catalog.get(0).unwrap();
    assert_eq!(parent.get(keys.n_child), 2);
    assert!(parent.get(keys.too_many_peaks));
    assert!(parent.get(keys.skipped));
    assert!(!parent.get(keys.failed));

    let outcome = report.outcome_for(parent.id()).unwrap();
    assert!(outcome.too_many_peaks);
}

#[test]
fn test_uncapped_config_flags_every_candidate() {
    let (deblender, _recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(0), deblender, &[2, 1]);
    let keys = *task.keys();

    run(&task, &mut catalog);

    assert!(catalog.get(0).unwrap().get(keys.too_many_peaks));
    assert!(!catalog.get(1).unwrap().get(keys.too_many_peaks));
}

#[test]
fn test_too_many_peaks_recorded_when_deblend_fails() {
    let (deblender, _recorder) = scripted(|_: &Footprint| Err(anyhow::anyhow!("nope")));
    let (task, mut catalog) = setup(capped(2), deblender, &[3]);
    let keys = *task.keys();

    run(&task, &mut catalog);

    let parent = catalog.get(0).unwrap();
    assert!(parent.get(keys.too_many_peaks));
    assert!(parent.get(keys.failed));
}

#[test]
fn test_summary_counts_add_up() {
    let (deblender, _recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[1, 2, 3, 0]);

    let report = run(&task, &mut catalog);

    assert_eq!(report.n_input, 4);
    assert_eq!(report.n_parents, 2);
    assert_eq!(report.n_children, 5);
    assert_eq!(report.n_total, 9);
    assert_eq!(catalog.len(), report.n_input + report.n_children);
    assert_eq!(
        report.summary(),
        "Deblended: of 4 sources, 2 were deblended, creating 5 children, total 9 sources"
    );
}

#[test]
fn test_parallel_dispatch_matches_serial() {
    let script = |fp: &Footprint| -> Result<DeblendResult> {
        match slot_of(fp) {
            3 => Err(anyhow::anyhow!("bad source")),
            6 => panic!("bad pixels"),
            slot if slot % 2 == 0 => {
                let mut result = one_child_per_peak(fp)?;
                result.peaks[0] = PeakOutcome::skipped();
                Ok(result)
            }
            _ => one_child_per_peak(fp),
        }
    };
    let counts = [2, 3, 1, 4, 2, 5, 3, 0, 2, 4, 2, 3];

    let (deblender, _recorder) = scripted(script);
    let (serial_task, mut serial) = setup(capped(3), deblender, &counts);
    let serial_report = run(&serial_task, &mut serial);

    let config = SourceDeblendConfig {
        parallel: true,
        ..capped(3)
    };
    let (deblender, recorder) = scripted(script);
    let (parallel_task, mut parallel) = setup(config, deblender, &counts);
    let parallel_report = run(&parallel_task, &mut parallel);

    assert_eq!(recorder.calls(), 10);
    assert_eq!(serial_report, parallel_report);
    assert_eq!(serial.len(), parallel.len());

    let keys = *serial_task.keys();
    for (a, b) in serial.iter().zip(parallel.iter()) {
        assert_eq!(a.id(), b.id());
        assert_eq!(a.parent(), b.parent());
        assert_eq!(a.footprint(), b.footprint());
        assert_eq!(a.get(keys.n_child), b.get(keys.n_child));
        assert_eq!(a.get(keys.failed), b.get(keys.failed));
        assert_eq!(a.get(keys.skipped), b.get(keys.skipped));
        assert_eq!(a.get(keys.too_many_peaks), b.get(keys.too_many_peaks));
    }
}

#[test]
fn test_noise_and_psf_width_shared_by_candidates() {
    let (deblender, recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[2, 2, 3]);

    let report = run(&task, &mut catalog);

    assert!((report.sigma1 - 2.0).abs() < 1e-12);
    let expected_fwhm = PSF_SIGMA * SIGMA_TO_FWHM;
    for (_, fwhm, sigma1) in recorder.seen() {
        assert!((fwhm - expected_fwhm).abs() < 1e-9);
        assert!((sigma1 - 2.0).abs() < 1e-12);
    }
}

#[test]
fn test_pre_hook_adjusts_inputs() {
    let (deblender, recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[2, 2]);
    let task = task.with_pre_hook(|ctx| {
        if ctx.parent_id == 2 {
            ctx.sigma1 = 7.0;
            ctx.psf_fwhm *= 2.0;
        }
    });

    run(&task, &mut catalog);

    let seen = recorder.seen();
    let fwhm = PSF_SIGMA * SIGMA_TO_FWHM;
    assert!((seen[0].1 - fwhm).abs() < 1e-9);
    assert!((seen[0].2 - 2.0).abs() < 1e-12);
    assert!((seen[1].1 - 2.0 * fwhm).abs() < 1e-9);
    assert_eq!(seen[1].2, 7.0);
}

#[test]
fn test_post_hook_sees_new_children() {
    let log: Arc<Mutex<Vec<(i64, usize, usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let parent_flux: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let (deblender, _recorder) = scripted(|fp: &Footprint| match slot_of(fp) {
        1 => Err(anyhow::anyhow!("skip the hook")),
        _ => one_child_per_peak(fp),
    });
    let (task, mut catalog) = setup(capped(8), deblender, &[3, 2, 2]);
    let sink = log.clone();
    let flux_sink = parent_flux.clone();
    let task = task.with_post_hook(move |ctx| {
        let linked = ctx
            .children
            .iter()
            .all(|c| c.parent() == Some(ctx.parent_id));
        sink.lock().unwrap().push((
            ctx.parent_id,
            ctx.npre,
            ctx.children.len(),
            linked && ctx.result.peaks.len() == ctx.footprint.peaks().len(),
        ));
        let flux: f64 = ctx
            .footprint
            .pixels()
            .filter_map(|(x, y)| ctx.image.pixel(x, y))
            .map(f64::from)
            .sum();
        flux_sink.lock().unwrap().push(flux);
    });

    run(&task, &mut catalog);

    let log = log.lock().unwrap();
    assert_eq!(*log, vec![(1, 3, 3, true), (3, 6, 2, true)]);

    // The hook reads the parent's own pixels from the image it was run on
    let image = noisy_image();
    let expected: Vec<f64> = [0, 2]
        .iter()
        .map(|&slot| {
            blend(slot, 2)
                .pixels()
                .filter_map(|(x, y)| image.pixel(x, y))
                .map(f64::from)
                .sum()
        })
        .collect();
    let parent_flux = parent_flux.lock().unwrap();
    assert_eq!(parent_flux.len(), 2);
    for (got, want) in parent_flux.iter().zip(&expected) {
        assert!(*got > 0.0);
        assert!((got - want).abs() < 1e-6);
    }
}

#[test]
fn test_noise_control_mask_changes_sigma1() {
    const NOISY: u16 = 0x4;
    // Most columns carry a much larger variance and the NOISY bit
    let noisy_column = |i: usize| i % WIDTH < WIDTH / 2 + 8;
    let variance: Vec<f32> = (0..WIDTH * HEIGHT)
        .map(|i| if noisy_column(i) { 100.0 } else { 4.0 })
        .collect();
    let mask: Vec<u16> = (0..WIDTH * HEIGHT)
        .map(|i| if noisy_column(i) { NOISY } else { 0 })
        .collect();
    let image = MaskedImage::new(WIDTH, HEIGHT, noisy_image().image().to_vec(), mask, variance)
        .unwrap();

    let (deblender, recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[2]);
    let unmasked = task.run(&image, &mut catalog, &psf()).unwrap();
    assert!((unmasked.sigma1 - 10.0).abs() < 1e-9);

    let (deblender, masked_recorder) = scripted(one_child_per_peak);
    let (task, mut catalog) = setup(capped(8), deblender, &[2]);
    let task = task.with_noise_control(StatisticsControl { and_mask: NOISY });
    let masked = task.run(&image, &mut catalog, &psf()).unwrap();
    assert!((masked.sigma1 - 2.0).abs() < 1e-9);

    assert!((recorder.seen()[0].2 - 10.0).abs() < 1e-9);
    assert!((masked_recorder.seen()[0].2 - 2.0).abs() < 1e-9);
}

#[test]
fn test_catalog_with_foreign_schema_is_rejected() {
    let (deblender, recorder) = scripted(one_child_per_peak);
    let (task, _catalog) = setup(capped(8), deblender, &[2]);

    let mut foreign = SourceCatalog::new(Schema::new());
    foreign.add_new().set_footprint(blend(0, 2));

    assert!(task.run(&noisy_image(), &mut foreign, &psf()).is_err());
    assert_eq!(recorder.calls(), 0);
    assert_eq!(foreign.len(), 1);
}
