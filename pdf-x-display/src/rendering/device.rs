//! Device trait for rendering backend abstraction.
//!
//! A device is a 2-D drawing surface with canvas semantics: path points are
//! transformed by the current matrix when they are added, state (transform,
//! clip, alpha, blend mode) is saved and restored as a stack, and images are
//! drawn into the unit of their pixel size in the current user space.
//!
//! The interpreter drives one root device per render and creates
//! off-surface devices from it for groups, soft masks and tiling patterns.

use std::sync::Arc;

use crate::core::error::{PDFError, PDFResult};
use crate::core::image::ImageBitmap;

use super::graphics_state::{BlendMode, Color, FillRule, StrokeProps};
use super::matrix::{self, IDENTITY, Matrix};

/// How to draw a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDrawMode {
    Fill(FillRule),
    Stroke,
}

/// Paint for drawing operations.
///
/// Gradient and image transforms map paint space straight to device space,
/// so a paint looks the same whatever the current matrix is.
#[derive(Debug, Clone, PartialEq)]
pub enum Paint {
    Solid(Color),
    LinearGradient {
        start: (f64, f64),
        end: (f64, f64),
        /// (offset in 0..=1, rgb)
        stops: Vec<(f32, [u8; 3])>,
        transform: Matrix,
    },
    RadialGradient {
        start: (f64, f64),
        start_radius: f64,
        end: (f64, f64),
        end_radius: f64,
        stops: Vec<(f32, [u8; 3])>,
        transform: Matrix,
    },
    /// An image repeated in both directions
    Tiled {
        image: Arc<ImageBitmap>,
        transform: Matrix,
    },
}

impl Paint {
    pub fn black() -> Self {
        Paint::Solid(Color::black())
    }

    pub fn white() -> Self {
        Paint::Solid(Color::white())
    }

    pub fn from_color(color: Color) -> Self {
        Paint::Solid(color)
    }
}

impl Default for Paint {
    fn default() -> Self {
        Paint::black()
    }
}

/// A drawing surface the interpreter renders into.
pub trait Device: Send {
    /// Surface width in device pixels.
    fn width(&self) -> u32;

    /// Surface height in device pixels.
    fn height(&self) -> u32;

    /// Discards the current path.
    fn begin_path(&mut self);

    fn move_to(&mut self, x: f64, y: f64);

    fn line_to(&mut self, x: f64, y: f64);

    /// Cubic Bézier from the current point.
    fn curve_to(&mut self, cp1x: f64, cp1y: f64, cp2x: f64, cp2y: f64, x: f64, y: f64);

    /// Quadratic Bézier from the current point.
    fn quad_to(&mut self, cpx: f64, cpy: f64, x: f64, y: f64);

    fn rect(&mut self, x: f64, y: f64, width: f64, height: f64);

    fn close_path(&mut self);

    /// Paints the current path. The path is kept, so a fill can be followed
    /// by a stroke of the same path.
    fn draw_path(
        &mut self,
        mode: PathDrawMode,
        paint: &Paint,
        stroke_props: &StrokeProps,
    ) -> PDFResult<()>;

    /// Intersects the clip with the current path.
    fn clip_path(&mut self, rule: FillRule) -> PDFResult<()>;

    fn save_state(&mut self);

    fn restore_state(&mut self);

    /// Concatenates `matrix` to the current transform (applied first).
    fn concat_matrix(&mut self, matrix: &Matrix);

    fn set_matrix(&mut self, matrix: &Matrix);

    fn get_transform(&self) -> Matrix;

    fn set_global_alpha(&mut self, alpha: f64);

    fn set_blend_mode(&mut self, mode: BlendMode);

    /// Draws `text` with a host font, baseline at the origin of the current
    /// user space, glyphs extending toward negative y.
    fn fill_text(&mut self, text: &str, family: &str, size: f64, paint: &Paint) -> PDFResult<()>;

    /// Draws `image` into `(0, 0, width, height)` of the current user space.
    fn draw_image(&mut self, image: &ImageBitmap) -> PDFResult<()>;

    /// The whole surface as straight RGBA, ignoring transform and clip.
    fn get_image_data(&self) -> ImageBitmap;

    /// Makes every pixel transparent.
    fn clear(&mut self);

    /// A new, transparent surface of the same kind.
    fn create_offscreen(&self, width: u32, height: u32) -> PDFResult<Box<dyn Device>>;
}

#[derive(Debug, Clone)]
struct TestGraphicsState {
    ctm: Matrix,
    alpha: f64,
}

impl Default for TestGraphicsState {
    fn default() -> Self {
        TestGraphicsState {
            ctm: IDENTITY,
            alpha: 1.0,
        }
    }
}

/// A device that records every call and rasterizes only the simple cases.
///
/// Axis-aligned rectangles filled with a solid color and images drawn under
/// an axis-aligned transform reach the RGBA buffer; everything else is only
/// logged. That is enough to observe compositing in tests.
#[derive(Debug)]
pub struct TestDevice {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    state_stack: Vec<TestGraphicsState>,
    /// Device-space bounds of the rectangles in the current path, or `None`
    /// once the path holds anything else
    path_rects: Option<Vec<[f64; 4]>>,
    operations: Vec<String>,
}

impl TestDevice {
    pub fn new(width: u32, height: u32) -> Self {
        TestDevice {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            state_stack: vec![TestGraphicsState::default()],
            path_rects: Some(Vec::new()),
            operations: Vec::new(),
        }
    }

    /// Get the recorded operations.
    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    /// Clear the recorded operations.
    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    /// RGBA of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let mut out = [0; 4];
        if let Some(pixel) = self.pixels.get(offset..offset + 4) {
            out.copy_from_slice(pixel);
        }
        out
    }

    fn state(&self) -> &TestGraphicsState {
        // The stack never drops below one entry.
        &self.state_stack[self.state_stack.len() - 1]
    }

    fn state_mut(&mut self) -> &mut TestGraphicsState {
        let last = self.state_stack.len() - 1;
        &mut self.state_stack[last]
    }

    fn is_axis_aligned(m: &Matrix) -> bool {
        m[1] == 0.0 && m[2] == 0.0
    }

    /// Source-over of a straight RGBA pixel.
    fn blend(&mut self, x: usize, y: usize, src: [u8; 4]) {
        let offset = (y * self.width as usize + x) * 4;
        let dst = &mut self.pixels[offset..offset + 4];
        let sa = f64::from(src[3]) / 255.0;
        let da = f64::from(dst[3]) / 255.0;
        let out_a = sa + da * (1.0 - sa);
        if out_a <= 0.0 {
            dst.copy_from_slice(&[0, 0, 0, 0]);
            return;
        }
        for channel in 0..3 {
            let value = (f64::from(src[channel]) * sa
                + f64::from(dst[channel]) * da * (1.0 - sa))
                / out_a;
            dst[channel] = value.round() as u8;
        }
        dst[3] = (out_a * 255.0).round() as u8;
    }

    fn fill_bounds(&mut self, bounds: [f64; 4], color: [u8; 4]) {
        let x0 = bounds[0].max(0.0).round() as usize;
        let y0 = bounds[1].max(0.0).round() as usize;
        let x1 = (bounds[2].round().max(0.0) as usize).min(self.width as usize);
        let y1 = (bounds[3].round().max(0.0) as usize).min(self.height as usize);
        for y in y0..y1 {
            for x in x0..x1 {
                self.blend(x, y, color);
            }
        }
    }

    fn invalidate_path(&mut self) {
        self.path_rects = None;
    }
}

impl Device for TestDevice {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn begin_path(&mut self) {
        self.path_rects = Some(Vec::new());
        self.operations.push("begin_path".to_string());
    }

    fn move_to(&mut self, x: f64, y: f64) {
        self.invalidate_path();
        self.operations.push(format!("move_to({},{})", x, y));
    }

    fn line_to(&mut self, x: f64, y: f64) {
        self.invalidate_path();
        self.operations.push(format!("line_to({},{})", x, y));
    }

    fn curve_to(&mut self, cp1x: f64, cp1y: f64, cp2x: f64, cp2y: f64, x: f64, y: f64) {
        self.invalidate_path();
        self.operations.push(format!(
            "curve_to({},{},{},{},{},{})",
            cp1x, cp1y, cp2x, cp2y, x, y
        ));
    }

    fn quad_to(&mut self, cpx: f64, cpy: f64, x: f64, y: f64) {
        self.invalidate_path();
        self.operations
            .push(format!("quad_to({},{},{},{})", cpx, cpy, x, y));
    }

    fn rect(&mut self, x: f64, y: f64, width: f64, height: f64) {
        let ctm = self.state().ctm;
        if Self::is_axis_aligned(&ctm) {
            let bounds = matrix::transform_bbox(&[x, y, x + width, y + height], &ctm);
            if let Some(rects) = self.path_rects.as_mut() {
                rects.push(bounds);
            }
        } else {
            self.invalidate_path();
        }
        self.operations
            .push(format!("rect({},{},{},{})", x, y, width, height));
    }

    fn close_path(&mut self) {
        self.operations.push("close_path".to_string());
    }

    fn draw_path(
        &mut self,
        mode: PathDrawMode,
        paint: &Paint,
        _stroke_props: &StrokeProps,
    ) -> PDFResult<()> {
        match mode {
            PathDrawMode::Fill(rule) => {
                self.operations.push(format!("draw_path(fill, {:?})", rule));
                if let (Paint::Solid(color), Some(rects)) = (paint, self.path_rects.clone()) {
                    let mut rgba = color.rgba();
                    rgba[3] = (f64::from(rgba[3]) * self.state().alpha).round() as u8;
                    for bounds in rects {
                        self.fill_bounds(bounds, rgba);
                    }
                }
            }
            PathDrawMode::Stroke => {
                self.operations.push("draw_path(stroke)".to_string());
            }
        }
        Ok(())
    }

    fn clip_path(&mut self, rule: FillRule) -> PDFResult<()> {
        self.operations.push(format!("clip_path({:?})", rule));
        Ok(())
    }

    fn save_state(&mut self) {
        let current = self.state().clone();
        self.state_stack.push(current);
        self.operations.push("save_state".to_string());
    }

    fn restore_state(&mut self) {
        if self.state_stack.len() > 1 {
            self.state_stack.pop();
        }
        self.operations.push("restore_state".to_string());
    }

    fn concat_matrix(&mut self, matrix: &Matrix) {
        let state = self.state_mut();
        state.ctm = matrix::multiply(&state.ctm, matrix);
        self.operations.push(format!("concat_matrix({:?})", matrix));
    }

    fn set_matrix(&mut self, matrix: &Matrix) {
        self.state_mut().ctm = *matrix;
        self.operations.push(format!("set_matrix({:?})", matrix));
    }

    fn get_transform(&self) -> Matrix {
        self.state().ctm
    }

    fn set_global_alpha(&mut self, alpha: f64) {
        self.state_mut().alpha = alpha.clamp(0.0, 1.0);
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.operations.push(format!("set_blend_mode({:?})", mode));
    }

    fn fill_text(&mut self, text: &str, family: &str, size: f64, _paint: &Paint) -> PDFResult<()> {
        self.operations
            .push(format!("fill_text({}, {}, {:?})", family, size, text));
        Ok(())
    }

    fn draw_image(&mut self, image: &ImageBitmap) -> PDFResult<()> {
        let ctm = self.state().ctm;
        self.operations
            .push(format!("draw_image({}x{}, {:?})", image.width, image.height, ctm));
        if !Self::is_axis_aligned(&ctm) || image.width == 0 || image.height == 0 {
            return Ok(());
        }
        let expected = image.width as usize * image.height as usize * 4;
        if image.data.len() < expected {
            return Err(PDFError::RenderingError(format!(
                "Image data too short: expected {} bytes, got {}",
                expected,
                image.data.len()
            )));
        }

        let bounds = matrix::transform_bbox(
            &[0.0, 0.0, f64::from(image.width), f64::from(image.height)],
            &ctm,
        );
        let Some(inverse) = matrix::inverse(&ctm) else {
            return Ok(());
        };
        let alpha = self.state().alpha;
        let x0 = bounds[0].max(0.0).round() as usize;
        let y0 = bounds[1].max(0.0).round() as usize;
        let x1 = (bounds[2].round().max(0.0) as usize).min(self.width as usize);
        let y1 = (bounds[3].round().max(0.0) as usize).min(self.height as usize);
        for y in y0..y1 {
            for x in x0..x1 {
                let (u, v) = matrix::apply(&inverse, x as f64 + 0.5, y as f64 + 0.5);
                if u < 0.0 || v < 0.0 {
                    continue;
                }
                let (u, v) = (u as usize, v as usize);
                if u >= image.width as usize || v >= image.height as usize {
                    continue;
                }
                let offset = (v * image.width as usize + u) * 4;
                let mut src = [0u8; 4];
                src.copy_from_slice(&image.data[offset..offset + 4]);
                src[3] = (f64::from(src[3]) * alpha).round() as u8;
                self.blend(x, y, src);
            }
        }
        Ok(())
    }

    fn get_image_data(&self) -> ImageBitmap {
        ImageBitmap {
            width: self.width,
            height: self.height,
            data: self.pixels.clone().into(),
        }
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
        self.operations.push("clear".to_string());
    }

    fn create_offscreen(&self, width: u32, height: u32) -> PDFResult<Box<dyn Device>> {
        Ok(Box::new(TestDevice::new(width, height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_operations() {
        let mut device = TestDevice::new(612, 792);

        device.begin_path();
        device.move_to(100.0, 200.0);
        device.line_to(300.0, 400.0);
        device
            .draw_path(
                PathDrawMode::Stroke,
                &Paint::black(),
                &StrokeProps::default(),
            )
            .unwrap();

        let ops = device.operations();
        assert_eq!(ops[0], "begin_path");
        assert_eq!(ops[1], "move_to(100,200)");
        assert_eq!(ops[2], "line_to(300,400)");
        assert_eq!(ops[3], "draw_path(stroke)");
    }

    #[test]
    fn test_state_save_restore() {
        let mut device = TestDevice::new(612, 792);

        device.save_state();
        device.concat_matrix(&[2.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        assert_eq!(device.get_transform(), [2.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        device.restore_state();
        assert_eq!(device.get_transform(), IDENTITY);

        let ops = device.operations();
        assert_eq!(ops[0], "save_state");
        assert_eq!(ops[1], "concat_matrix([2.0, 0.0, 0.0, 2.0, 0.0, 0.0])");
        assert_eq!(ops[2], "restore_state");
    }

    #[test]
    fn test_rect_fill_reaches_pixels() {
        let mut device = TestDevice::new(4, 4);
        device.concat_matrix(&[1.0, 0.0, 0.0, -1.0, 0.0, 4.0]);
        device.begin_path();
        device.rect(0.0, 0.0, 2.0, 2.0);
        device
            .draw_path(
                PathDrawMode::Fill(FillRule::NonZero),
                &Paint::Solid(Color::RGB(1.0, 0.0, 0.0)),
                &StrokeProps::default(),
            )
            .unwrap();

        // y-up rect (0,0)-(2,2) lands in the bottom-left corner.
        assert_eq!(device.pixel(0, 3), [255, 0, 0, 255]);
        assert_eq!(device.pixel(1, 2), [255, 0, 0, 255]);
        assert_eq!(device.pixel(3, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn test_draw_image_with_alpha() {
        let mut device = TestDevice::new(2, 2);
        device.set_global_alpha(0.5);
        device.concat_matrix(&[2.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        let image = ImageBitmap {
            width: 1,
            height: 1,
            data: vec![0, 0, 255, 255].into(),
        };
        device.draw_image(&image).unwrap();
        assert_eq!(device.pixel(1, 1), [0, 0, 255, 128]);
    }
}
