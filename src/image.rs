use crate::geom::BoundingBox;
use anyhow::{Context, Result};
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue, Hdu};
use std::path::Path;

/// Image, mask and variance planes sharing one pixel grid.
///
/// Pixel coordinates are "parent" coordinates: pixel (x0, y0) is the first
/// element of each plane.
#[derive(Debug, Clone)]
pub struct MaskedImage {
    width: usize,
    height: usize,
    x0: i32,
    y0: i32,
    image: Vec<f32>,
    mask: Vec<u16>,
    variance: Vec<f32>,
}

impl MaskedImage {
    pub fn new(
        width: usize,
        height: usize,
        image: Vec<f32>,
        mask: Vec<u16>,
        variance: Vec<f32>,
    ) -> Result<Self> {
        let expected = width * height;
        for (name, len) in [
            ("image", image.len()),
            ("mask", mask.len()),
            ("variance", variance.len()),
        ] {
            if len != expected {
                return Err(anyhow::anyhow!(
                    "Data size mismatch in {} plane: expected {} pixels, got {}",
                    name,
                    expected,
                    len
                ));
            }
        }

        Ok(Self {
            width,
            height,
            x0: 0,
            y0: 0,
            image,
            mask,
            variance,
        })
    }

    /// Image with an empty mask and constant variance
    pub fn with_constant_variance(
        width: usize,
        height: usize,
        image: Vec<f32>,
        variance: f32,
    ) -> Result<Self> {
        let n = width * height;
        Self::new(width, height, image, vec![0; n], vec![variance; n])
    }

    pub fn with_origin(mut self, x0: i32, y0: i32) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x0, self.y0, self.width as i32, self.height as i32)
    }

    pub fn image(&self) -> &[f32] {
        &self.image
    }

    pub fn mask(&self) -> &[u16] {
        &self.mask
    }

    pub fn variance(&self) -> &[f32] {
        &self.variance
    }

    /// Plane index of a parent-coordinate pixel, if it lies on the image
    pub fn index(&self, x: i32, y: i32) -> Option<usize> {
        let col = x - self.x0;
        let row = y - self.y0;
        if col < 0 || row < 0 || col as usize >= self.width || row as usize >= self.height {
            return None;
        }
        Some(row as usize * self.width + col as usize)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.index(x, y).is_some()
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<f32> {
        self.index(x, y).map(|i| self.image[i])
    }

    /// Whether a pixel sits on the outermost row or column
    pub fn is_edge_pixel(&self, x: i32, y: i32) -> bool {
        let bbox = self.bbox();
        self.contains(x, y) && (x == bbox.x0 || x == bbox.x1() || y == bbox.y0 || y == bbox.y1())
    }

    /// Load a masked image from FITS.
    ///
    /// Extensions named IMAGE, MASK and VARIANCE are used when present;
    /// otherwise the first 2-D HDU is the image, the mask is empty and the
    /// variance is `fallback_variance` everywhere.
    pub fn from_fits(path: &Path, fallback_variance: Option<f32>) -> Result<Self> {
        let fits = Fits::open(path)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

        let mut image_hdu = None;
        let mut mask_hdu = None;
        let mut variance_hdu = None;
        let mut first_2d = None;

        let mut index = 0;
        while let Some(hdu) = fits.get(index) {
            let naxis = header_int(&hdu, "NAXIS").unwrap_or(0);
            match extname(&hdu).as_deref() {
                Some("IMAGE") => image_hdu = Some(index),
                Some("MASK") => mask_hdu = Some(index),
                Some("VARIANCE") => variance_hdu = Some(index),
                _ => {
                    if naxis >= 2 && first_2d.is_none() {
                        first_2d = Some(index);
                    }
                }
            }
            index += 1;
        }

        let image_index = image_hdu
            .or(first_2d)
            .ok_or_else(|| anyhow::anyhow!("No 2D image HDU found in {}", path.display()))?;
        let image_hdu = fits
            .get(image_index)
            .ok_or_else(|| anyhow::anyhow!("HDU {} disappeared", image_index))?;

        let width = header_int(&image_hdu, "NAXIS1")
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS1 header"))? as usize;
        let height = header_int(&image_hdu, "NAXIS2")
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS2 header"))? as usize;
        let x0 = header_int(&image_hdu, "LTV1").map(|v| -v as i32).unwrap_or(0);
        let y0 = header_int(&image_hdu, "LTV2").map(|v| -v as i32).unwrap_or(0);

        let image = read_plane(&image_hdu).context("Failed to read image plane")?;

        let mask = match mask_hdu.and_then(|i| fits.get(i)) {
            Some(hdu) => read_plane(&hdu)
                .context("Failed to read mask plane")?
                .into_iter()
                .map(|v| v.clamp(0.0, u16::MAX as f32) as u16)
                .collect(),
            None => vec![0; width * height],
        };

        let variance = match variance_hdu.and_then(|i| fits.get(i)) {
            Some(hdu) => read_plane(&hdu).context("Failed to read variance plane")?,
            None => {
                let value = fallback_variance.ok_or_else(|| {
                    anyhow::anyhow!(
                        "{} has no VARIANCE extension and no fallback variance was given",
                        path.display()
                    )
                })?;
                vec![value; width * height]
            }
        };

        Ok(Self::new(width, height, image, mask, variance)?.with_origin(x0, y0))
    }
}

fn header_int(hdu: &Hdu, key: &str) -> Option<i64> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) => Some(*n as i64),
        Some(HeaderValue::RealFloatingNumber(f)) => Some(*f as i64),
        _ => None,
    }
}

fn header_float(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) => Some(*n as f64),
        Some(HeaderValue::RealFloatingNumber(f)) => Some(*f),
        _ => None,
    }
}

fn extname(hdu: &Hdu) -> Option<String> {
    match hdu.value("EXTNAME") {
        Some(HeaderValue::CharacterString(s)) => Some(s.trim().to_uppercase()),
        _ => None,
    }
}

/// Read one HDU's data as physical values (BZERO/BSCALE applied)
fn read_plane(hdu: &Hdu) -> Result<Vec<f32>> {
    let bzero = header_float(hdu, "BZERO").unwrap_or(0.0);
    let bscale = header_float(hdu, "BSCALE").unwrap_or(1.0);
    let scale = |raw: f64| (bzero + bscale * raw) as f32;

    let data = match hdu.read_data() {
        FitsData::Characters(_) => {
            return Err(anyhow::anyhow!(
                "FITS HDU contains character data, not image data"
            ));
        }
        FitsData::IntegersI32(FitsDataArray { data, .. }) => data
            .iter()
            .map(|&x| x.map(|v| scale(v as f64)).unwrap_or(f32::NAN))
            .collect(),
        FitsData::IntegersU32(FitsDataArray { data, .. }) => data
            .iter()
            .map(|&x| x.map(|v| scale(v as f64)).unwrap_or(f32::NAN))
            .collect(),
        FitsData::FloatingPoint32(FitsDataArray { data, .. }) => {
            data.iter().map(|&x| scale(x as f64)).collect()
        }
        FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
            data.iter().map(|&x| scale(x)).collect()
        }
    };

    Ok(data)
}
