use crate::geom::BoundingBox;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A local intensity maximum inside a footprint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub x: i32,
    pub y: i32,
    /// Pixel value at the peak
    #[serde(default)]
    pub value: f32,
}

impl Peak {
    pub fn new(x: i32, y: i32, value: f32) -> Self {
        Self { x, y, value }
    }
}

/// One row of a footprint, `x0..=x1` at row `y`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub y: i32,
    pub x0: i32,
    pub x1: i32,
}

impl Span {
    pub fn len(&self) -> usize {
        (self.x1 - self.x0 + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.x1 < self.x0
    }
}

/// Pixel set and peak list of one detection.
///
/// A footprint carrying per-pixel `flux` values is "heavy": that is what the
/// deblender hands back as a peak's flux portion. Flux values are stored in
/// pixel iteration order (spans in order, x ascending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    spans: Vec<Span>,
    #[serde(default)]
    peaks: Vec<Peak>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    flux: Option<Vec<f32>>,
    #[serde(skip)]
    bbox: Option<BoundingBox>,
}

impl Default for Footprint {
    fn default() -> Self {
        Self {
            spans: Vec::new(),
            peaks: Vec::new(),
            flux: None,
            bbox: Some(BoundingBox::empty()),
        }
    }
}

impl Footprint {
    /// Build a footprint from spans. Spans are sorted by (y, x0); peaks keep
    /// the order given (brightest-first by convention of the detection stage).
    pub fn new(mut spans: Vec<Span>, peaks: Vec<Peak>) -> Result<Self> {
        if let Some(bad) = spans.iter().find(|s| s.is_empty()) {
            return Err(anyhow::anyhow!(
                "Invalid span at y={}: x0={} > x1={}",
                bad.y,
                bad.x0,
                bad.x1
            ));
        }
        spans.sort_by_key(|s| (s.y, s.x0));

        let mut footprint = Self {
            spans,
            peaks,
            flux: None,
            bbox: None,
        };
        footprint.bbox = Some(footprint.compute_bbox());
        Ok(footprint)
    }

    /// Build a footprint from individual pixels; duplicates are merged
    pub fn from_pixels(pixels: &[(i32, i32)], peaks: Vec<Peak>) -> Self {
        let mut sorted: Vec<(i32, i32)> = pixels.iter().map(|&(x, y)| (y, x)).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut spans: Vec<Span> = Vec::new();
        for (y, x) in sorted {
            match spans.last_mut() {
                Some(span) if span.y == y && span.x1 + 1 == x => span.x1 = x,
                _ => spans.push(Span { y, x0: x, x1: x }),
            }
        }

        let mut footprint = Self {
            spans,
            peaks,
            flux: None,
            bbox: None,
        };
        footprint.bbox = Some(footprint.compute_bbox());
        footprint
    }

    /// Attach per-pixel flux values, turning this into a heavy footprint
    pub fn with_flux(mut self, flux: Vec<f32>) -> Result<Self> {
        if flux.len() != self.area() {
            return Err(anyhow::anyhow!(
                "Flux size mismatch: footprint has {} pixels, got {} values",
                self.area(),
                flux.len()
            ));
        }
        self.flux = Some(flux);
        Ok(self)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn flux(&self) -> Option<&[f32]> {
        self.flux.as_deref()
    }

    pub fn is_heavy(&self) -> bool {
        self.flux.is_some()
    }

    /// Bounding box of the pixel set
    pub fn bbox(&self) -> BoundingBox {
        self.bbox.unwrap_or_else(|| self.compute_bbox())
    }

    /// Number of pixels
    pub fn area(&self) -> usize {
        self.spans.iter().map(Span::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.spans
            .iter()
            .any(|s| s.y == y && x >= s.x0 && x <= s.x1)
    }

    /// Iterate pixels in span order
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.spans
            .iter()
            .flat_map(|s| (s.x0..=s.x1).map(move |x| (x, s.y)))
    }

    /// Total flux of a heavy footprint
    pub fn total_flux(&self) -> Option<f64> {
        self.flux
            .as_ref()
            .map(|values| values.iter().map(|&v| v as f64).sum())
    }

    fn compute_bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for span in &self.spans {
            bbox.include(span.x0, span.y);
            bbox.include(span.x1, span.y);
        }
        bbox
    }

    /// Restore derived state after deserialization
    pub(crate) fn normalize(mut self) -> Result<Self> {
        let flux = self.flux.take();
        let mut footprint = Self::new(self.spans, self.peaks)?;
        if let Some(flux) = flux {
            footprint = footprint.with_flux(flux)?;
        }
        Ok(footprint)
    }
}
