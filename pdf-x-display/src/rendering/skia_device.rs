//! A tiny-skia based rendering device.

use tiny_skia::{
    BlendMode as SkiaBlendMode, Color as SkiaColor, ColorU8, FillRule as SkiaFillRule,
    FilterQuality, GradientStop, LineCap as SkiaLineCap, LineJoin as SkiaLineJoin,
    LinearGradient, Mask, Paint as SkiaPaint, Path, PathBuilder, Pattern, Pixmap, PixmapPaint,
    Point, RadialGradient, SpreadMode, Stroke, StrokeDash, Transform,
};
use tracing::debug;

use crate::core::error::{PDFError, PDFResult};
use crate::core::image::ImageBitmap;
use crate::rendering::device::{Device, Paint, PathDrawMode};
use crate::rendering::graphics_state::{BlendMode, FillRule, LineCap, LineJoin, StrokeProps};
use crate::rendering::matrix::{self, IDENTITY, Matrix};

// --- Conversion helpers ---

fn to_transform(m: &Matrix) -> Transform {
    Transform::from_row(
        m[0] as f32,
        m[1] as f32,
        m[2] as f32,
        m[3] as f32,
        m[4] as f32,
        m[5] as f32,
    )
}

fn to_skia_line_cap(line_cap: LineCap) -> SkiaLineCap {
    match line_cap {
        LineCap::Butt => SkiaLineCap::Butt,
        LineCap::Round => SkiaLineCap::Round,
        LineCap::ProjectingSquare => SkiaLineCap::Square,
    }
}

fn to_skia_line_join(line_join: LineJoin) -> SkiaLineJoin {
    match line_join {
        LineJoin::Miter => SkiaLineJoin::Miter,
        LineJoin::Round => SkiaLineJoin::Round,
        LineJoin::Bevel => SkiaLineJoin::Bevel,
    }
}

fn to_skia_fill_rule(fill_rule: FillRule) -> SkiaFillRule {
    match fill_rule {
        FillRule::NonZero => SkiaFillRule::Winding,
        FillRule::EvenOdd => SkiaFillRule::EvenOdd,
    }
}

fn to_skia_blend_mode(mode: BlendMode) -> SkiaBlendMode {
    match mode {
        BlendMode::Normal => SkiaBlendMode::SourceOver,
        BlendMode::Multiply => SkiaBlendMode::Multiply,
        BlendMode::Screen => SkiaBlendMode::Screen,
        BlendMode::Overlay => SkiaBlendMode::Overlay,
        BlendMode::Darken => SkiaBlendMode::Darken,
        BlendMode::Lighten => SkiaBlendMode::Lighten,
        BlendMode::ColorDodge => SkiaBlendMode::ColorDodge,
        BlendMode::ColorBurn => SkiaBlendMode::ColorBurn,
        BlendMode::HardLight => SkiaBlendMode::HardLight,
        BlendMode::SoftLight => SkiaBlendMode::SoftLight,
        BlendMode::Difference => SkiaBlendMode::Difference,
        BlendMode::Exclusion => SkiaBlendMode::Exclusion,
        BlendMode::Hue => SkiaBlendMode::Hue,
        BlendMode::Saturation => SkiaBlendMode::Saturation,
        BlendMode::Color => SkiaBlendMode::Color,
        BlendMode::Luminosity => SkiaBlendMode::Luminosity,
    }
}

fn to_skia_stroke(stroke_props: &StrokeProps) -> Stroke {
    let dash = if stroke_props.dash_array.is_empty() {
        None
    } else {
        StrokeDash::new(
            stroke_props.dash_array.iter().map(|v| *v as f32).collect(),
            stroke_props.dash_offset as f32,
        )
    };
    Stroke {
        width: stroke_props.line_width as f32,
        miter_limit: stroke_props.miter_limit as f32,
        line_cap: to_skia_line_cap(stroke_props.line_cap),
        line_join: to_skia_line_join(stroke_props.line_join),
        dash,
    }
}

fn gradient_stops(stops: &[(f32, [u8; 3])], alpha: u8) -> Vec<GradientStop> {
    stops
        .iter()
        .map(|(offset, [r, g, b])| {
            GradientStop::new(*offset, SkiaColor::from_rgba8(*r, *g, *b, alpha))
        })
        .collect()
}

/// Straight RGBA to a premultiplied pixmap.
fn bitmap_to_pixmap(image: &ImageBitmap) -> PDFResult<Pixmap> {
    let mut pixmap = Pixmap::new(image.width, image.height).ok_or_else(|| {
        PDFError::RenderingError(format!(
            "Cannot allocate a {}x{} pixmap",
            image.width, image.height
        ))
    })?;
    let expected = image.width as usize * image.height as usize * 4;
    if image.data.len() < expected {
        return Err(PDFError::RenderingError(format!(
            "Image data too short: expected {} bytes, got {}",
            expected,
            image.data.len()
        )));
    }
    for (dst, src) in pixmap
        .pixels_mut()
        .iter_mut()
        .zip(image.data.chunks_exact(4))
    {
        *dst = ColorU8::from_rgba(src[0], src[1], src[2], src[3]).premultiply();
    }
    Ok(pixmap)
}

/// A path segment in device space.
#[derive(Debug, Clone, Copy)]
enum Segment {
    MoveTo(f32, f32),
    LineTo(f32, f32),
    CubicTo(f32, f32, f32, f32, f32, f32),
    QuadTo(f32, f32, f32, f32),
    Close,
}

#[derive(Clone)]
struct SkiaGraphicsState {
    transform: Matrix,
    clip: Option<Mask>,
    alpha: f32,
    blend_mode: SkiaBlendMode,
}

impl Default for SkiaGraphicsState {
    fn default() -> Self {
        SkiaGraphicsState {
            transform: IDENTITY,
            clip: None,
            alpha: 1.0,
            blend_mode: SkiaBlendMode::SourceOver,
        }
    }
}

/// Renders into an owned premultiplied RGBA pixmap.
///
/// Host text has no font engine behind it here; glyphs with outlines are
/// drawn as paths by the interpreter and `fill_text` is a no-op.
pub struct SkiaDevice {
    pixmap: Pixmap,
    state_stack: Vec<SkiaGraphicsState>,
    segments: Vec<Segment>,
}

impl SkiaDevice {
    pub fn new(width: u32, height: u32) -> PDFResult<Self> {
        let pixmap = Pixmap::new(width, height).ok_or_else(|| {
            PDFError::RenderingError(format!("Cannot allocate a {}x{} surface", width, height))
        })?;
        Ok(SkiaDevice {
            pixmap,
            state_stack: vec![SkiaGraphicsState::default()],
            segments: Vec::new(),
        })
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    pub fn into_pixmap(self) -> Pixmap {
        self.pixmap
    }

    fn current_state(&self) -> &SkiaGraphicsState {
        &self.state_stack[self.state_stack.len() - 1]
    }

    fn current_state_mut(&mut self) -> &mut SkiaGraphicsState {
        let last = self.state_stack.len() - 1;
        &mut self.state_stack[last]
    }

    fn point(&self, x: f64, y: f64) -> (f32, f32) {
        let (x, y) = matrix::apply(&self.current_state().transform, x, y);
        (x as f32, y as f32)
    }

    fn build_path(&self) -> Option<Path> {
        let mut builder = PathBuilder::new();
        for segment in &self.segments {
            match *segment {
                Segment::MoveTo(x, y) => builder.move_to(x, y),
                Segment::LineTo(x, y) => builder.line_to(x, y),
                Segment::CubicTo(x1, y1, x2, y2, x, y) => builder.cubic_to(x1, y1, x2, y2, x, y),
                Segment::QuadTo(x1, y1, x, y) => builder.quad_to(x1, y1, x, y),
                Segment::Close => builder.close(),
            }
        }
        builder.finish()
    }

    fn snapshot(&self) -> (f32, SkiaBlendMode, Option<Mask>) {
        let state = self.current_state();
        (state.alpha, state.blend_mode, state.clip.clone())
    }
}

/// Rasterized tile of a `Paint::Tiled`, which the shader borrows.
fn tile_pixmap(paint: &Paint) -> PDFResult<Option<Pixmap>> {
    match paint {
        Paint::Tiled { image, .. } => bitmap_to_pixmap(image).map(Some),
        _ => Ok(None),
    }
}

/// Builds the tiny-skia paint. `space` maps the coordinates the shape is
/// drawn in to device space; `None` means nothing can be painted.
fn skia_paint<'a>(
    paint: &Paint,
    space: &Matrix,
    alpha: f32,
    blend_mode: SkiaBlendMode,
    tile: Option<&'a Pixmap>,
) -> Option<SkiaPaint<'a>> {
    let space_inverse = matrix::inverse(space)?;
    let shader_transform = |m: &Matrix| to_transform(&matrix::multiply(&space_inverse, m));
    let alpha_u8 = (alpha.clamp(0.0, 1.0) * 255.0).round() as u8;

    let mut sk_paint = SkiaPaint {
        anti_alias: true,
        blend_mode,
        ..SkiaPaint::default()
    };
    match paint {
        Paint::Solid(color) => {
            let [r, g, b, a] = color.rgba();
            let a = (f32::from(a) * alpha).round() as u8;
            sk_paint.set_color_rgba8(r, g, b, a);
        }
        Paint::LinearGradient {
            start,
            end,
            stops,
            transform,
        } => {
            sk_paint.shader = LinearGradient::new(
                Point::from_xy(start.0 as f32, start.1 as f32),
                Point::from_xy(end.0 as f32, end.1 as f32),
                gradient_stops(stops, alpha_u8),
                SpreadMode::Pad,
                shader_transform(transform),
            )?;
        }
        Paint::RadialGradient {
            start,
            end,
            end_radius,
            stops,
            transform,
            ..
        } => {
            sk_paint.shader = RadialGradient::new(
                Point::from_xy(start.0 as f32, start.1 as f32),
                Point::from_xy(end.0 as f32, end.1 as f32),
                *end_radius as f32,
                gradient_stops(stops, alpha_u8),
                SpreadMode::Pad,
                shader_transform(transform),
            )?;
        }
        Paint::Tiled { transform, .. } => {
            sk_paint.shader = Pattern::new(
                tile?.as_ref(),
                SpreadMode::Repeat,
                FilterQuality::Bilinear,
                alpha,
                shader_transform(transform),
            );
        }
    }
    Some(sk_paint)
}

impl Device for SkiaDevice {
    fn width(&self) -> u32 {
        self.pixmap.width()
    }

    fn height(&self) -> u32 {
        self.pixmap.height()
    }

    fn begin_path(&mut self) {
        self.segments.clear();
    }

    fn move_to(&mut self, x: f64, y: f64) {
        let (x, y) = self.point(x, y);
        self.segments.push(Segment::MoveTo(x, y));
    }

    fn line_to(&mut self, x: f64, y: f64) {
        let (x, y) = self.point(x, y);
        self.segments.push(Segment::LineTo(x, y));
    }

    fn curve_to(&mut self, cp1x: f64, cp1y: f64, cp2x: f64, cp2y: f64, x: f64, y: f64) {
        let (x1, y1) = self.point(cp1x, cp1y);
        let (x2, y2) = self.point(cp2x, cp2y);
        let (x, y) = self.point(x, y);
        self.segments.push(Segment::CubicTo(x1, y1, x2, y2, x, y));
    }

    fn quad_to(&mut self, cpx: f64, cpy: f64, x: f64, y: f64) {
        let (x1, y1) = self.point(cpx, cpy);
        let (x, y) = self.point(x, y);
        self.segments.push(Segment::QuadTo(x1, y1, x, y));
    }

    fn rect(&mut self, x: f64, y: f64, width: f64, height: f64) {
        self.move_to(x, y);
        self.line_to(x + width, y);
        self.line_to(x + width, y + height);
        self.line_to(x, y + height);
        self.close_path();
    }

    fn close_path(&mut self) {
        self.segments.push(Segment::Close);
    }

    fn draw_path(
        &mut self,
        mode: PathDrawMode,
        paint: &Paint,
        stroke_props: &StrokeProps,
    ) -> PDFResult<()> {
        let Some(path) = self.build_path() else {
            return Ok(());
        };
        let (alpha, blend_mode, clip) = self.snapshot();
        let tile = tile_pixmap(paint)?;

        match mode {
            PathDrawMode::Fill(fill_rule) => {
                let Some(sk_paint) = skia_paint(paint, &IDENTITY, alpha, blend_mode, tile.as_ref())
                else {
                    return Ok(());
                };
                self.pixmap.fill_path(
                    &path,
                    &sk_paint,
                    to_skia_fill_rule(fill_rule),
                    Transform::identity(),
                    clip.as_ref(),
                );
            }
            PathDrawMode::Stroke => {
                // Line widths are in user space, so the device path goes
                // back through the inverse of the current transform.
                let ctm = self.current_state().transform;
                let Some(inverse) = matrix::inverse(&ctm) else {
                    debug!("Skipping stroke under a singular transform");
                    return Ok(());
                };
                let Some(user_path) = path.transform(to_transform(&inverse)) else {
                    return Ok(());
                };
                let Some(sk_paint) = skia_paint(paint, &ctm, alpha, blend_mode, tile.as_ref())
                else {
                    return Ok(());
                };
                self.pixmap.stroke_path(
                    &user_path,
                    &sk_paint,
                    &to_skia_stroke(stroke_props),
                    to_transform(&ctm),
                    clip.as_ref(),
                );
            }
        }

        Ok(())
    }

    fn clip_path(&mut self, rule: FillRule) -> PDFResult<()> {
        let path = self.build_path();
        let (width, height) = (self.pixmap.width(), self.pixmap.height());
        let state = self.current_state_mut();
        let mut mask = match state.clip.take() {
            Some(mask) => mask,
            None => {
                let mut mask = Mask::new(width, height).ok_or_else(|| {
                    PDFError::RenderingError("Cannot allocate a clip mask".into())
                })?;
                if let Some(path) = &path {
                    mask.fill_path(path, to_skia_fill_rule(rule), true, Transform::identity());
                }
                state.clip = Some(mask);
                return Ok(());
            }
        };
        match &path {
            Some(path) => {
                mask.intersect_path(path, to_skia_fill_rule(rule), true, Transform::identity())
            }
            // An empty path clips everything away.
            None => {
                mask = Mask::new(width, height).ok_or_else(|| {
                    PDFError::RenderingError("Cannot allocate a clip mask".into())
                })?;
            }
        }
        state.clip = Some(mask);
        Ok(())
    }

    fn save_state(&mut self) {
        let current_state = self.current_state().clone();
        self.state_stack.push(current_state);
    }

    fn restore_state(&mut self) {
        if self.state_stack.len() > 1 {
            self.state_stack.pop();
        }
    }

    fn concat_matrix(&mut self, m: &Matrix) {
        let state = self.current_state_mut();
        state.transform = matrix::multiply(&state.transform, m);
    }

    fn set_matrix(&mut self, m: &Matrix) {
        self.current_state_mut().transform = *m;
    }

    fn get_transform(&self) -> Matrix {
        self.current_state().transform
    }

    fn set_global_alpha(&mut self, alpha: f64) {
        self.current_state_mut().alpha = alpha.clamp(0.0, 1.0) as f32;
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.current_state_mut().blend_mode = to_skia_blend_mode(mode);
    }

    fn fill_text(&mut self, text: &str, family: &str, size: f64, _paint: &Paint) -> PDFResult<()> {
        debug!(text, family, size, "No host font engine, skipping text");
        Ok(())
    }

    fn draw_image(&mut self, image: &ImageBitmap) -> PDFResult<()> {
        if image.width == 0 || image.height == 0 {
            return Ok(());
        }
        let image_pixmap = bitmap_to_pixmap(image)?;
        let state = self.current_state();
        let paint = PixmapPaint {
            opacity: state.alpha,
            blend_mode: state.blend_mode,
            quality: FilterQuality::Bilinear,
        };
        let transform = to_transform(&state.transform);
        let clip = state.clip.clone();
        self.pixmap
            .draw_pixmap(0, 0, image_pixmap.as_ref(), &paint, transform, clip.as_ref());
        Ok(())
    }

    fn get_image_data(&self) -> ImageBitmap {
        let mut data = Vec::with_capacity(self.pixmap.data().len());
        for pixel in self.pixmap.pixels() {
            let color = pixel.demultiply();
            data.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }
        ImageBitmap {
            width: self.pixmap.width(),
            height: self.pixmap.height(),
            data: data.into(),
        }
    }

    fn clear(&mut self) {
        self.pixmap.fill(SkiaColor::TRANSPARENT);
    }

    fn create_offscreen(&self, width: u32, height: u32) -> PDFResult<Box<dyn Device>> {
        Ok(Box::new(SkiaDevice::new(width, height)?))
    }
}
