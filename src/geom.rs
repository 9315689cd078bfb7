use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Sub-pixel position in parent image coordinates
pub type Point2D = Point2<f64>;

/// Integer pixel box in parent image coordinates. `x0`/`y0` are the
/// lower-left corner, `width`/`height` are in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: i32,
    pub y0: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x0: i32, y0: i32, width: i32, height: i32) -> Self {
        Self {
            x0,
            y0,
            width: width.max(0),
            height: height.max(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Smallest box containing both corners (inclusive)
    pub fn from_corners(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Inclusive maximum x
    pub fn x1(&self) -> i32 {
        self.x0 + self.width - 1
    }

    /// Inclusive maximum y
    pub fn y1(&self) -> i32 {
        self.y0 + self.height - 1
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        !self.is_empty() && x >= self.x0 && x <= self.x1() && y >= self.y0 && y <= self.y1()
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn center(&self) -> Point2D {
        Point2D::new(
            self.x0 as f64 + (self.width as f64 - 1.0) / 2.0,
            self.y0 as f64 + (self.height as f64 - 1.0) / 2.0,
        )
    }

    /// Grow the box to include a pixel
    pub fn include(&mut self, x: i32, y: i32) {
        if self.is_empty() {
            *self = Self::new(x, y, 1, 1);
            return;
        }
        let min_x = self.x0.min(x);
        let min_y = self.y0.min(y);
        let max_x = self.x1().max(x);
        let max_y = self.y1().max(y);
        *self = Self::from_corners(min_x, min_y, max_x, max_y);
    }
}
