//! Page-to-surface mapping.

use crate::core::error::{PDFError, PDFResult};

use super::matrix::{self, Matrix};

/// Inputs of a [`PageViewport`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportParameters {
    /// Page box `[x0, y0, x1, y1]` in user space
    pub view_box: [f64; 4],
    pub scale: f64,
    /// Degrees, a multiple of 90
    pub rotation: i32,
    pub offset_x: f64,
    pub offset_y: f64,
    /// Keep the PDF y-up orientation instead of flipping to y-down
    pub dont_flip: bool,
}

impl Default for ViewportParameters {
    fn default() -> Self {
        ViewportParameters {
            view_box: [0.0, 0.0, 612.0, 792.0],
            scale: 1.0,
            rotation: 0,
            offset_x: 0.0,
            offset_y: 0.0,
            dont_flip: false,
        }
    }
}

/// Maps page user space onto a y-down surface of `width` x `height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageViewport {
    pub view_box: [f64; 4],
    pub scale: f64,
    pub rotation: i32,
    pub offset_x: f64,
    pub offset_y: f64,
    pub transform: Matrix,
    pub width: f64,
    pub height: f64,
    dont_flip: bool,
}

impl PageViewport {
    pub fn new(params: ViewportParameters) -> PDFResult<Self> {
        let view_box = params.view_box;
        let center_x = (view_box[2] + view_box[0]) / 2.0;
        let center_y = (view_box[3] + view_box[1]) / 2.0;

        let rotation = params.rotation.rem_euclid(360);
        let (rotate_a, rotate_b, mut rotate_c, mut rotate_d) = match rotation {
            0 => (1.0, 0.0, 0.0, -1.0),
            90 => (0.0, 1.0, 1.0, 0.0),
            180 => (-1.0, 0.0, 0.0, 1.0),
            270 => (0.0, -1.0, -1.0, 0.0),
            _ => {
                return Err(PDFError::Generic(
                    "PageViewport: Invalid rotation, must be a multiple of 90 degrees.".into(),
                ));
            }
        };
        if params.dont_flip {
            rotate_c = -rotate_c;
            rotate_d = -rotate_d;
        }

        let scale = params.scale;
        let (offset_canvas_x, offset_canvas_y, width, height) = if rotate_a == 0.0 {
            (
                (center_y - view_box[1]).abs() * scale + params.offset_x,
                (center_x - view_box[0]).abs() * scale + params.offset_y,
                (view_box[3] - view_box[1]).abs() * scale,
                (view_box[2] - view_box[0]).abs() * scale,
            )
        } else {
            (
                (center_x - view_box[0]).abs() * scale + params.offset_x,
                (center_y - view_box[1]).abs() * scale + params.offset_y,
                (view_box[2] - view_box[0]).abs() * scale,
                (view_box[3] - view_box[1]).abs() * scale,
            )
        };

        let transform = [
            rotate_a * scale,
            rotate_b * scale,
            rotate_c * scale,
            rotate_d * scale,
            offset_canvas_x - rotate_a * scale * center_x - rotate_c * scale * center_y,
            offset_canvas_y - rotate_b * scale * center_x - rotate_d * scale * center_y,
        ];

        Ok(PageViewport {
            view_box,
            scale,
            rotation,
            offset_x: params.offset_x,
            offset_y: params.offset_y,
            transform,
            width,
            height,
            dont_flip: params.dont_flip,
        })
    }

    /// A copy with a different scale and/or rotation.
    pub fn clone_with(&self, scale: Option<f64>, rotation: Option<i32>) -> PDFResult<Self> {
        PageViewport::new(ViewportParameters {
            view_box: self.view_box,
            scale: scale.unwrap_or(self.scale),
            rotation: rotation.unwrap_or(self.rotation),
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            dont_flip: self.dont_flip,
        })
    }

    /// Surface size in whole pixels.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width.ceil().max(1.0) as u32, self.height.ceil().max(1.0) as u32)
    }

    pub fn convert_to_viewport_point(&self, x: f64, y: f64) -> (f64, f64) {
        matrix::apply(&self.transform, x, y)
    }

    pub fn convert_to_viewport_rectangle(&self, rect: &[f64; 4]) -> [f64; 4] {
        let (x0, y0) = self.convert_to_viewport_point(rect[0], rect[1]);
        let (x1, y1) = self.convert_to_viewport_point(rect[2], rect[3]);
        [x0, y0, x1, y1]
    }

    /// Surface coordinates back to page user space.
    pub fn convert_to_pdf_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        matrix::inverse(&self.transform).map(|inverse| matrix::apply(&inverse, x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_page_at_unit_scale() {
        let viewport = PageViewport::new(ViewportParameters::default()).unwrap();
        assert_eq!(viewport.transform, [1.0, 0.0, 0.0, -1.0, 0.0, 792.0]);
        assert_eq!((viewport.width, viewport.height), (612.0, 792.0));
        assert_eq!(viewport.convert_to_viewport_point(0.0, 0.0), (0.0, 792.0));
        assert_eq!(viewport.convert_to_pdf_point(0.0, 792.0), Some((0.0, 0.0)));
    }

    #[test]
    fn test_rotation_swaps_dimensions() {
        let viewport = PageViewport::new(ViewportParameters {
            rotation: 90,
            scale: 2.0,
            ..Default::default()
        })
        .unwrap();
        assert_eq!((viewport.width, viewport.height), (1584.0, 1224.0));
        assert_eq!(viewport.convert_to_viewport_point(0.0, 0.0), (0.0, 0.0));

        let negative = viewport.clone_with(None, Some(-90)).unwrap();
        assert_eq!(negative.rotation, 270);
    }

    #[test]
    fn test_invalid_rotation() {
        let result = PageViewport::new(ViewportParameters {
            rotation: 45,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_clone_with_scale() {
        let viewport = PageViewport::new(ViewportParameters::default()).unwrap();
        let doubled = viewport.clone_with(Some(2.0), None).unwrap();
        assert_eq!(doubled.transform, [2.0, 0.0, 0.0, -2.0, 0.0, 1584.0]);
        assert_eq!(doubled.pixel_size(), (1224, 1584));
    }
}
