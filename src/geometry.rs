//! Sensor-to-display box geometry.
//!
//! Cameras report boxes in their native orientation. The display frame is the
//! sensor frame rotated 90 degrees clockwise and then flipped vertically, which
//! composes to swapping the two axes of every corner.

/// Axis-aligned box in display space, normalized to 0..1.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DisplayBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DisplayBox {
    /// Builds a box from two opposite corners in any order.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        let (xmin, xmax) = min_max(x1, x2);
        let (ymin, ymax) = min_max(y1, y2);
        Self {
            x: xmin,
            y: ymin,
            width: xmax - xmin,
            height: ymax - ymin,
        }
    }
}

/// Maps sensor corners `[x1, y1, x2, y2]` into a display box.
pub fn sensor_to_display(corners: [f64; 4]) -> DisplayBox {
    let [x1, y1, x2, y2] = corners;
    let (dx1, dy1) = swap_axes(x1, y1);
    let (dx2, dy2) = swap_axes(x2, y2);
    DisplayBox::from_corners(dx1, dy1, dx2, dy2)
}

// rotate 90 cw then flip vertically
fn swap_axes(x: f64, y: f64) -> (f64, f64) {
    (y, x)
}

fn min_max(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
