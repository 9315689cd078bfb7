use crate::image::MaskedImage;
use anyhow::Result;
use bumpalo::Bump;

/// Pixel selection for image statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsControl {
    /// Pixels with any of these mask bits set are ignored (0: use all)
    pub and_mask: u16,
}

/// Per-image noise level: square root of the median per-pixel variance
/// over finite, unmasked pixels.
pub fn estimate_noise(image: &MaskedImage, ctrl: &StatisticsControl) -> Result<f64> {
    let median = median_variance(image, ctrl)?;
    if median < 0.0 {
        return Err(anyhow::anyhow!("Median variance is negative: {}", median));
    }
    Ok(median.sqrt())
}

/// Median of the variance plane under `ctrl`
pub fn median_variance(image: &MaskedImage, ctrl: &StatisticsControl) -> Result<f64> {
    // Use arena for temporary allocation
    let arena = Bump::new();
    let mut values = bumpalo::vec![in &arena];
    values.extend(
        image
            .variance()
            .iter()
            .zip(image.mask())
            .filter(|(v, m)| v.is_finite() && (**m & ctrl.and_mask) == 0)
            .map(|(&v, _)| v),
    );

    if values.is_empty() {
        return Err(anyhow::anyhow!(
            "No usable variance pixels (and_mask=0x{:x})",
            ctrl.and_mask
        ));
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] as f64 + values[mid] as f64) / 2.0
    } else {
        values[mid] as f64
    };

    Ok(median)
}
