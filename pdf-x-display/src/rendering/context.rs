//! Operator-list interpreter.
//!
//! [`RenderingContext`] executes an [`OperatorList`] against a [`Device`]:
//! - a save/restore stack of [`GraphicsState`]s
//! - off-surface layers for transparency groups, soft masks and the
//!   transparent page layer, pooled in [`CachedSurfaces`]
//! - nested runs for Type 3 glyph programs and tiling pattern cells
//! - time slicing and dependency stalls, reported as a [`Step`]
//!
//! The root device is passed into every call so that the caller can keep it
//! behind its own lock between steps.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::core::error::{PDFError, PDFResult};
use crate::core::font::{FontResource, PathCommand};
use crate::core::image::ImageBitmap;
use crate::core::object_pool::{PDFObjects, PoolObject};
use crate::core::operator_list::{
    GStateEntry, GlyphItem, GroupOptions, InlineImagePlacement, MaskPlacement, OpArg, OpCode,
    OperatorList, PatternIR, SMaskOptions, ShadingIR, ShadingKind, TilingPatternIR,
};

use super::cached_surfaces::{CachedSurfaces, SurfaceKey, SurfacePurpose};
use super::device::{Device, Paint, PathDrawMode};
use super::graphics_state::{
    BlendMode, Color, ColorSource, FillRule, GraphicsState, LineCap, LineJoin, StrokeProps,
    TextRenderingMode,
};
use super::matrix::{self, IDENTITY, Matrix};
use super::smask::{MAX_GROUP_SIZE, SoftMask};
use super::viewport::PageViewport;

/// Wall-clock budget of one time slice.
pub const EXECUTION_TIME: Duration = Duration::from_millis(15);
/// Operators run between two clock checks.
pub const EXECUTION_STEPS: usize = 10;
/// Largest side of a tiling pattern cell, unless the output is larger.
pub const MAX_PATTERN_SIZE: u32 = 3000;

/// Where a call to [`RenderingContext::execute_operator_list`] stopped.
pub enum Step {
    /// Every available operator ran; the value is the list length.
    Done(usize),
    /// The time slice ran out; resume at this index.
    Yield(usize),
    /// A dependency is unresolved; resume at `index` once `pending` settles.
    Blocked {
        index: usize,
        pending: BoxFuture<'static, PDFResult<PoolObject>>,
    },
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Done(index) => f.debug_tuple("Done").field(index).finish(),
            Step::Yield(index) => f.debug_tuple("Yield").field(index).finish(),
            Step::Blocked { index, .. } => f.debug_struct("Blocked").field("index", index).finish(),
        }
    }
}

enum LayerKind {
    /// Page content composited onto the root at the end
    Transparent,
    Group {
        smask: Option<SMaskOptions>,
        offset_x: f64,
        offset_y: f64,
        scale_x: f64,
        scale_y: f64,
    },
    /// Content drawn while a soft mask is active, sized to the mask
    SMaskMode(Arc<SoftMask>),
}

struct Layer {
    key: SurfaceKey,
    device: Box<dyn Device>,
    /// Root device space to this layer's device space
    from_root: Matrix,
    kind: LayerKind,
}

fn top_device<'a>(layers: &'a mut [Layer], root: &'a mut dyn Device) -> &'a mut dyn Device {
    match layers.last_mut() {
        Some(layer) => layer.device.as_mut(),
        None => root,
    }
}

// --- Argument access ---

fn arg(args: &[OpArg], index: usize) -> PDFResult<&OpArg> {
    args.get(index)
        .ok_or_else(|| PDFError::RenderingError(format!("Missing operator argument {}", index)))
}

fn num(args: &[OpArg], index: usize) -> PDFResult<f64> {
    match arg(args, index)? {
        OpArg::Number(value) => Ok(*value),
        _ => Err(PDFError::RenderingError(format!(
            "Operator argument {} is not a number",
            index
        ))),
    }
}

/// `N` numbers, either spread over the arguments or packed into the first.
fn nums<const N: usize>(args: &[OpArg]) -> PDFResult<[f64; N]> {
    let mut out = [0.0; N];
    if let Some(OpArg::Numbers(values)) = args.first() {
        if values.len() < N {
            return Err(PDFError::RenderingError(format!(
                "Expected {} numbers, got {}",
                N,
                values.len()
            )));
        }
        out.copy_from_slice(&values[..N]);
        return Ok(out);
    }
    for (index, slot) in out.iter_mut().enumerate() {
        *slot = num(args, index)?;
    }
    Ok(out)
}

fn fixed_numbers<const N: usize>(args: &[OpArg], index: usize) -> Option<[f64; N]> {
    let values = args.get(index)?.as_numbers()?;
    let mut out = [0.0; N];
    out.copy_from_slice(values.get(..N)?);
    Some(out)
}

fn numbers_at(args: &[OpArg], index: usize) -> PDFResult<&[f64]> {
    match arg(args, index)? {
        OpArg::Numbers(values) => Ok(values),
        OpArg::Null => Ok(&[]),
        _ => Err(PDFError::RenderingError(format!(
            "Operator argument {} is not a number array",
            index
        ))),
    }
}

/// Image pixel space to the unit square, top row at `y = 1`.
fn image_to_unit(width: u32, height: u32) -> Matrix {
    let (w, h) = (f64::from(width), f64::from(height));
    [1.0 / w, 0.0, 0.0, -1.0 / h, 0.0, 1.0]
}

fn crop_bitmap(image: &ImageBitmap, placement: &InlineImagePlacement) -> Option<ImageBitmap> {
    let InlineImagePlacement { x, y, w, h, .. } = *placement;
    let fits = |start: u32, len: u32, limit: u32| start.checked_add(len).is_some_and(|end| end <= limit);
    if w == 0 || h == 0 || !fits(x, w, image.width) || !fits(y, h, image.height) {
        return None;
    }
    let (width, x, y, w, h) = (
        image.width as usize,
        x as usize,
        y as usize,
        w as usize,
        h as usize,
    );
    let mut data = Vec::with_capacity(w * h * 4);
    for row in y..y + h {
        let start = (row * width + x) * 4;
        data.extend_from_slice(image.data.get(start..start + w * 4)?);
    }
    Some(ImageBitmap {
        width: w as u32,
        height: h as u32,
        data: data.into(),
    })
}

fn transform_commands(commands: &[PathCommand], m: &Matrix) -> Vec<PathCommand> {
    commands
        .iter()
        .map(|command| match *command {
            PathCommand::MoveTo(x, y) => {
                let (x, y) = matrix::apply(m, x, y);
                PathCommand::MoveTo(x, y)
            }
            PathCommand::LineTo(x, y) => {
                let (x, y) = matrix::apply(m, x, y);
                PathCommand::LineTo(x, y)
            }
            PathCommand::CurveTo(x1, y1, x2, y2, x, y) => {
                let (x1, y1) = matrix::apply(m, x1, y1);
                let (x2, y2) = matrix::apply(m, x2, y2);
                let (x, y) = matrix::apply(m, x, y);
                PathCommand::CurveTo(x1, y1, x2, y2, x, y)
            }
            PathCommand::QuadraticCurveTo(x1, y1, x, y) => {
                let (x1, y1) = matrix::apply(m, x1, y1);
                let (x, y) = matrix::apply(m, x, y);
                PathCommand::QuadraticCurveTo(x1, y1, x, y)
            }
            PathCommand::ClosePath => PathCommand::ClosePath,
        })
        .collect()
}

fn add_commands(device: &mut dyn Device, commands: &[PathCommand]) {
    for command in commands {
        match *command {
            PathCommand::MoveTo(x, y) => device.move_to(x, y),
            PathCommand::LineTo(x, y) => device.line_to(x, y),
            PathCommand::CurveTo(x1, y1, x2, y2, x, y) => device.curve_to(x1, y1, x2, y2, x, y),
            PathCommand::QuadraticCurveTo(x1, y1, x, y) => device.quad_to(x1, y1, x, y),
            PathCommand::ClosePath => device.close_path(),
        }
    }
}

fn gradient_paint(shading: &ShadingIR, transform: Matrix) -> Paint {
    let stops = shading.stops.clone();
    match shading.kind {
        ShadingKind::Axial {
            coords: [x0, y0, x1, y1],
        } => Paint::LinearGradient {
            start: (x0, y0),
            end: (x1, y1),
            stops,
            transform,
        },
        ShadingKind::Radial {
            coords: [x0, y0, r0, x1, y1, r1],
        } => Paint::RadialGradient {
            start: (x0, y0),
            start_radius: r0,
            end: (x1, y1),
            end_radius: r1,
            stops,
            transform,
        },
    }
}

/// Cell size in pixels and the scale that fits `step` into it.
fn size_and_scale(step: f64, real_output_size: u32, scale: f64) -> (u32, f64) {
    let step = step.abs();
    let max_size = f64::from(MAX_PATTERN_SIZE.max(real_output_size));
    let mut size = (step * scale).ceil();
    let mut scale = scale;
    if size >= max_size {
        size = max_size;
    } else if step > 0.0 {
        scale = size / step;
    }
    (size.max(1.0) as u32, scale)
}

/// Interprets operator lists for one render.
pub struct RenderingContext {
    common_objs: Arc<PDFObjects>,
    objs: Arc<PDFObjects>,

    current: GraphicsState,
    state_stack: Vec<GraphicsState>,

    layers: Vec<Layer>,
    surfaces: CachedSurfaces,
    /// Nesting depth of this context; keys its pooled surfaces
    generation: usize,
    group_level: usize,
    smask_counter: usize,
    /// Mask group finished last, activated by `SMask` in a gstate
    temp_smask: Option<Arc<SoftMask>>,

    /// Page space after the viewport transform, in root device space
    base_transform: Matrix,
    base_transform_stack: Vec<Matrix>,

    pending_clip: Option<FillRule>,
    /// Glyph outlines in user space for clipping text modes
    pending_text_paths: Option<Vec<PathCommand>>,
    current_point: (f64, f64),
    subpath_start: (f64, f64),
}

impl RenderingContext {
    pub fn new(common_objs: Arc<PDFObjects>, objs: Arc<PDFObjects>) -> Self {
        RenderingContext {
            common_objs,
            objs,
            current: GraphicsState::default(),
            state_stack: Vec::new(),
            layers: Vec::new(),
            surfaces: CachedSurfaces::default(),
            generation: 0,
            group_level: 0,
            smask_counter: 0,
            temp_smask: None,
            base_transform: IDENTITY,
            base_transform_stack: Vec::new(),
            pending_clip: None,
            pending_text_paths: None,
            current_point: (0.0, 0.0),
            subpath_start: (0.0, 0.0),
        }
    }

    /// The current graphics state.
    pub fn current_state(&self) -> &GraphicsState {
        &self.current
    }

    pub fn state_depth(&self) -> usize {
        self.state_stack.len()
    }

    /// Fills the page background and installs the page transform.
    pub fn begin_drawing(
        &mut self,
        root: &mut dyn Device,
        viewport: &PageViewport,
        transform: Option<&Matrix>,
        background: Option<Color>,
        transparency: bool,
    ) -> PDFResult<()> {
        let (width, height) = (root.width(), root.height());
        root.save_state();
        root.set_matrix(&IDENTITY);
        root.set_global_alpha(1.0);
        root.begin_path();
        root.rect(0.0, 0.0, f64::from(width), f64::from(height));
        let filled = root.draw_path(
            PathDrawMode::Fill(FillRule::NonZero),
            &Paint::Solid(background.unwrap_or_else(Color::white)),
            &StrokeProps::default(),
        );
        root.begin_path();
        root.restore_state();
        filled?;

        if transparency {
            let key = SurfaceKey::new(SurfacePurpose::Transparent, self.generation);
            let mut device = self.surfaces.take(key, width, height, &*root)?;
            device.set_matrix(&root.get_transform());
            self.layers.push(Layer {
                key,
                device,
                from_root: IDENTITY,
                kind: LayerKind::Transparent,
            });
        }

        let device = top_device(&mut self.layers, root);
        device.save_state();
        if let Some(transform) = transform {
            device.concat_matrix(transform);
        }
        device.concat_matrix(&viewport.transform);
        self.base_transform = device.get_transform();
        Ok(())
    }

    /// Unwinds every state and layer and composites the transparent layer.
    pub fn end_drawing(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let finished = self.finish(root);
        self.surfaces.clear();
        finished
    }

    fn finish(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        while !self.state_stack.is_empty() || self.smask_mode().is_some() {
            self.restore(root)?;
        }
        self.current.active_smask = None;

        while matches!(
            self.layers.last(),
            Some(Layer {
                kind: LayerKind::Group { .. } | LayerKind::SMaskMode(_),
                ..
            })
        ) {
            if let Some(layer) = self.layers.pop() {
                warn!("Dropping an unterminated group");
                self.surfaces.put(layer.key, layer.device);
            }
        }
        top_device(&mut self.layers, root).restore_state();

        if let Some(layer) = self.layers.pop() {
            let bitmap = layer.device.get_image_data();
            self.surfaces.put(layer.key, layer.device);
            root.save_state();
            root.set_matrix(&IDENTITY);
            root.set_global_alpha(1.0);
            root.set_blend_mode(BlendMode::Normal);
            let drawn = root.draw_image(&bitmap);
            root.restore_state();
            drawn?;
        }
        Ok(())
    }

    /// Runs `list` from `start`.
    ///
    /// With `time_sliced`, long runs stop with [`Step::Yield`] once
    /// [`EXECUTION_TIME`] has passed so the caller can reschedule.
    pub fn execute_operator_list(
        &mut self,
        root: &mut dyn Device,
        list: &OperatorList,
        start: usize,
        time_sliced: bool,
    ) -> PDFResult<Step> {
        let total = list.fn_array.len().min(list.args_array.len());
        if start >= total {
            return Ok(Step::Done(total));
        }

        let chunked = time_sliced && total - start > EXECUTION_STEPS;
        let end_time = Instant::now() + EXECUTION_TIME;
        let mut steps = 0;
        let mut index = start;

        loop {
            let fn_id = list.fn_array[index];
            let args = &list.args_array[index];
            match OpCode::from_id(fn_id) {
                Some(OpCode::Dependency) => {
                    for id in args.iter().filter_map(OpArg::as_name) {
                        let pool = self.pool_for(id);
                        if !pool.has(id) {
                            debug!(id, index, "Waiting for dependency");
                            let pending = Box::pin(pool.get_async(id));
                            return Ok(Step::Blocked { index, pending });
                        }
                    }
                }
                Some(op) => self.execute_op(root, op, args)?,
                None => warn!(fn_id, "Unknown operator id, skipping"),
            }

            index += 1;
            if index == total {
                return Ok(Step::Done(index));
            }
            if chunked {
                steps += 1;
                if steps > EXECUTION_STEPS {
                    if Instant::now() > end_time {
                        return Ok(Step::Yield(index));
                    }
                    steps = 0;
                }
            }
        }
    }

    /// Runs a whole nested list (glyph program, pattern cell) in one go.
    fn execute_nested(&mut self, root: &mut dyn Device, list: &OperatorList) -> PDFResult<()> {
        for (fn_id, args) in list.fn_array.iter().zip(&list.args_array) {
            match OpCode::from_id(*fn_id) {
                Some(OpCode::Dependency) => {
                    if let Some(id) = args
                        .iter()
                        .filter_map(OpArg::as_name)
                        .find(|id| !self.pool_for(id).has(id))
                    {
                        debug!(id, "Unresolved dependency in nested operator list");
                        return Ok(());
                    }
                }
                Some(op) => self.execute_op(root, op, args)?,
                None => warn!(fn_id, "Unknown operator id, skipping"),
            }
        }
        Ok(())
    }

    fn pool_for(&self, id: &str) -> &Arc<PDFObjects> {
        if id.starts_with("g_") {
            &self.common_objs
        } else {
            &self.objs
        }
    }

    fn execute_op(&mut self, root: &mut dyn Device, op: OpCode, args: &[OpArg]) -> PDFResult<()> {
        trace!(?op, "Executing operator");
        match op {
            OpCode::Dependency => {}

            // Graphics state
            OpCode::SetLineWidth => self.current.stroke_props.line_width = num(args, 0)?,
            OpCode::SetLineCap => {
                self.current.stroke_props.line_cap = LineCap::from_u8(num(args, 0)? as u8)
            }
            OpCode::SetLineJoin => {
                self.current.stroke_props.line_join = LineJoin::from_u8(num(args, 0)? as u8)
            }
            OpCode::SetMiterLimit => self.current.stroke_props.miter_limit = num(args, 0)?,
            OpCode::SetDash => {
                self.current.stroke_props.dash_array = numbers_at(args, 0)?.to_vec();
                self.current.stroke_props.dash_offset = num(args, 1)?;
            }
            OpCode::SetRenderingIntent | OpCode::SetFlatness => {}
            OpCode::SetGState => match arg(args, 0)? {
                OpArg::GState(entries) => self.set_gstate(root, entries)?,
                _ => return Err(PDFError::RenderingError("SetGState expects entries".into())),
            },
            OpCode::Save => self.save(root),
            OpCode::Restore => self.restore(root)?,
            OpCode::Transform => {
                let m = nums::<6>(args)?;
                self.each_device(root, |device| device.concat_matrix(&m));
            }

            // Path construction
            OpCode::MoveTo => {
                let [x, y] = nums::<2>(args)?;
                self.move_to(root, x, y);
            }
            OpCode::LineTo => {
                let [x, y] = nums::<2>(args)?;
                self.line_to(root, x, y);
            }
            OpCode::CurveTo => {
                let [x1, y1, x2, y2, x, y] = nums::<6>(args)?;
                self.curve_to(root, x1, y1, x2, y2, x, y);
            }
            OpCode::CurveTo2 => {
                let [x2, y2, x, y] = nums::<4>(args)?;
                let (x1, y1) = self.current_point;
                self.curve_to(root, x1, y1, x2, y2, x, y);
            }
            OpCode::CurveTo3 => {
                let [x1, y1, x, y] = nums::<4>(args)?;
                self.curve_to(root, x1, y1, x, y, x, y);
            }
            OpCode::ClosePath => self.close_path(root),
            OpCode::Rectangle => {
                let [x, y, width, height] = nums::<4>(args)?;
                self.rectangle(root, x, y, width, height);
            }
            OpCode::ConstructPath => self.construct_path(root, args)?,

            // Path painting
            OpCode::Stroke => {
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::CloseStroke => {
                self.close_path(root);
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::Fill => {
                self.fill_path(root, FillRule::NonZero)?;
                self.consume_path(root)?;
            }
            OpCode::EOFill => {
                self.fill_path(root, FillRule::EvenOdd)?;
                self.consume_path(root)?;
            }
            OpCode::FillStroke => {
                self.fill_path(root, FillRule::NonZero)?;
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::EOFillStroke => {
                self.fill_path(root, FillRule::EvenOdd)?;
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::CloseFillStroke => {
                self.close_path(root);
                self.fill_path(root, FillRule::NonZero)?;
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::CloseEOFillStroke => {
                self.close_path(root);
                self.fill_path(root, FillRule::EvenOdd)?;
                self.stroke_path(root)?;
                self.consume_path(root)?;
            }
            OpCode::EndPath => self.consume_path(root)?,

            // Clipping
            OpCode::Clip => self.pending_clip = Some(FillRule::NonZero),
            OpCode::EOClip => self.pending_clip = Some(FillRule::EvenOdd),

            // Text objects
            OpCode::BeginText => self.current.begin_text(),
            OpCode::EndText => self.end_text(root)?,

            // Text state
            OpCode::SetCharSpacing => self.current.char_spacing = num(args, 0)?,
            OpCode::SetWordSpacing => self.current.word_spacing = num(args, 0)?,
            OpCode::SetHScale => self.current.text_h_scale = num(args, 0)? / 100.0,
            OpCode::SetLeading => self.current.leading = -num(args, 0)?,
            OpCode::SetFont => {
                let name = arg(args, 0)?.as_name().ok_or_else(|| {
                    PDFError::RenderingError("SetFont expects a font name".into())
                })?;
                let size = num(args, 1)?;
                self.set_font(name, size)?;
            }
            OpCode::SetTextRenderingMode => {
                let mode = num(args, 0)?;
                match TextRenderingMode::from_u8(mode as u8) {
                    Some(mode) => self.current.text_rendering_mode = mode,
                    None => warn!(mode, "Unsupported text rendering mode"),
                }
            }
            OpCode::SetTextRise => self.current.text_rise = num(args, 0)?,

            // Text positioning
            OpCode::MoveText => {
                let [x, y] = nums::<2>(args)?;
                self.current.move_text(x, y);
            }
            OpCode::SetLeadingMoveText => {
                let [x, y] = nums::<2>(args)?;
                self.current.leading = y;
                self.current.move_text(x, y);
            }
            OpCode::SetTextMatrix => self.current.set_text_matrix(nums::<6>(args)?),
            OpCode::NextLine => self.current.next_line(),

            // Text showing
            OpCode::ShowText | OpCode::ShowSpacedText => self.show_text(root, glyphs_arg(args, 0)?)?,
            OpCode::NextLineShowText => {
                self.current.next_line();
                self.show_text(root, glyphs_arg(args, 0)?)?;
            }
            OpCode::NextLineSetSpacingShowText => {
                self.current.word_spacing = num(args, 0)?;
                self.current.char_spacing = num(args, 1)?;
                self.current.next_line();
                self.show_text(root, glyphs_arg(args, 2)?)?;
            }

            // Type 3 glyph metrics
            OpCode::SetCharWidth => {}
            OpCode::SetCharWidthAndBounds => {
                let [_, _, llx, lly, urx, ury] = nums::<6>(args)?;
                self.rectangle(root, llx, lly, urx - llx, ury - lly);
                self.pending_clip = Some(FillRule::NonZero);
                self.consume_path(root)?;
            }

            // Color
            OpCode::SetStrokeColorSpace | OpCode::SetFillColorSpace => {}
            OpCode::SetStrokeColor | OpCode::SetStrokeColorN => {
                self.current.stroke = color_source(args)?
            }
            OpCode::SetFillColor | OpCode::SetFillColorN => self.current.fill = color_source(args)?,
            OpCode::SetStrokeGray => {
                self.current.stroke = ColorSource::Solid(Color::Gray(num(args, 0)?))
            }
            OpCode::SetFillGray => self.current.fill = ColorSource::Solid(Color::Gray(num(args, 0)?)),
            OpCode::SetStrokeRGBColor => {
                let [r, g, b] = nums::<3>(args)?;
                self.current.stroke = ColorSource::Solid(Color::RGB(r, g, b));
            }
            OpCode::SetFillRGBColor => {
                let [r, g, b] = nums::<3>(args)?;
                self.current.fill = ColorSource::Solid(Color::RGB(r, g, b));
            }
            OpCode::SetStrokeCMYKColor => {
                let [c, m, y, k] = nums::<4>(args)?;
                self.current.stroke = ColorSource::Solid(Color::CMYK(c, m, y, k));
            }
            OpCode::SetFillCMYKColor => {
                let [c, m, y, k] = nums::<4>(args)?;
                self.current.fill = ColorSource::Solid(Color::CMYK(c, m, y, k));
            }

            OpCode::ShadingFill => match arg(args, 0)? {
                OpArg::Shading(shading) => self.shading_fill(root, shading)?,
                _ => return Err(PDFError::RenderingError("ShadingFill expects a shading".into())),
            },

            // Expanded by the evaluator into the paint operators below
            OpCode::BeginInlineImage
            | OpCode::BeginImageData
            | OpCode::EndInlineImage
            | OpCode::PaintXObject => {}

            // Marked content and compatibility sections draw nothing
            OpCode::MarkPoint
            | OpCode::MarkPointProps
            | OpCode::BeginMarkedContent
            | OpCode::BeginMarkedContentProps
            | OpCode::EndMarkedContent
            | OpCode::BeginCompat
            | OpCode::EndCompat => {}

            OpCode::PaintFormXObjectBegin => {
                let form_matrix = fixed_numbers::<6>(args, 0);
                let bbox = fixed_numbers::<4>(args, 1);
                self.paint_form_begin(root, form_matrix, bbox)?;
            }
            OpCode::PaintFormXObjectEnd => {
                self.restore(root)?;
                if let Some(base) = self.base_transform_stack.pop() {
                    self.base_transform = base;
                }
            }
            OpCode::BeginGroup => match arg(args, 0)? {
                OpArg::Group(group) => self.begin_group(root, group)?,
                _ => return Err(PDFError::RenderingError("BeginGroup expects options".into())),
            },
            OpCode::EndGroup => self.end_group(root)?,
            OpCode::BeginAnnotations => {
                self.save(root);
                let base = self.device_base_transform();
                self.set_transform(root, &base);
            }
            OpCode::EndAnnotations => self.restore(root)?,
            OpCode::BeginAnnotation => self.begin_annotation(root, args)?,
            OpCode::EndAnnotation => self.restore(root)?,

            // Images
            OpCode::PaintJpegXObject | OpCode::PaintImageXObject => {
                if let Some(image) = self.image_arg(arg(args, 0)?)? {
                    self.draw_image(root, &image, None)?;
                }
            }
            OpCode::PaintInlineImageXObject => {
                if let Some(image) = self.image_arg(arg(args, 0)?)? {
                    self.draw_image(root, &image, None)?;
                }
            }
            OpCode::PaintInlineImageXObjectGroup => {
                let Some(image) = self.image_arg(arg(args, 0)?)? else {
                    return Ok(());
                };
                match arg(args, 1)? {
                    OpArg::InlineImagePlacements(map) => {
                        self.paint_inline_image_group(root, &image, map)?
                    }
                    _ => {
                        return Err(PDFError::RenderingError(
                            "Inline image group expects placements".into(),
                        ));
                    }
                }
            }
            OpCode::PaintImageXObjectRepeat => {
                let Some(image) = self.image_arg(arg(args, 0)?)? else {
                    return Ok(());
                };
                let scale_x = num(args, 1)?;
                let scale_y = num(args, 2)?;
                let positions = numbers_at(args, 3)?;
                let map: Vec<InlineImagePlacement> = positions
                    .chunks_exact(2)
                    .map(|position| InlineImagePlacement {
                        transform: [scale_x, 0.0, 0.0, scale_y, position[0], position[1]],
                        x: 0,
                        y: 0,
                        w: image.width,
                        h: image.height,
                    })
                    .collect();
                self.paint_inline_image_group(root, &image, &map)?;
            }
            OpCode::PaintImageMaskXObject => match arg(args, 0)? {
                OpArg::ImageMask(mask) => {
                    let bitmap = mask.to_bitmap(self.mask_color())?;
                    self.draw_image(root, &bitmap, None)?;
                }
                _ => return Err(PDFError::RenderingError("Expected an image mask".into())),
            },
            OpCode::PaintImageMaskXObjectGroup => match arg(args, 0)? {
                OpArg::ImageMaskGroup(group) => self.paint_image_mask_group(root, group)?,
                _ => return Err(PDFError::RenderingError("Expected an image mask group".into())),
            },
            OpCode::PaintImageMaskXObjectRepeat => {
                let OpArg::ImageMask(mask) = arg(args, 0)? else {
                    return Err(PDFError::RenderingError("Expected an image mask".into()));
                };
                let [scale_x, skew_x, skew_y, scale_y] = [
                    num(args, 1)?,
                    num(args, 2)?,
                    num(args, 3)?,
                    num(args, 4)?,
                ];
                let bitmap = mask.to_bitmap(self.mask_color())?;
                for position in numbers_at(args, 5)?.chunks_exact(2) {
                    let transform = [scale_x, skew_x, skew_y, scale_y, position[0], position[1]];
                    self.draw_image(root, &bitmap, Some(&transform))?;
                }
            }
            OpCode::PaintSolidColorImageMask => {
                self.each_device(root, |device| {
                    device.begin_path();
                    device.rect(0.0, 0.0, 1.0, 1.0);
                });
                self.fill_path(root, FillRule::NonZero)?;
                self.each_device(root, |device| device.begin_path());
            }
        }
        Ok(())
    }

    // --- Device plumbing ---

    fn smask_mode(&self) -> Option<&Arc<SoftMask>> {
        match self.layers.last() {
            Some(Layer {
                kind: LayerKind::SMaskMode(smask),
                ..
            }) => Some(smask),
            _ => None,
        }
    }

    /// Applies a state or path operation to the current device, and to the
    /// suspended device under an active soft mask so both stay in step.
    fn each_device(&mut self, root: &mut dyn Device, mut op: impl FnMut(&mut dyn Device)) {
        if self.smask_mode().is_some() {
            match self.layers.len().checked_sub(2) {
                Some(below) => op(self.layers[below].device.as_mut()),
                None => op(&mut *root),
            }
        }
        op(top_device(&mut self.layers, root));
    }

    fn top_from_root(&self) -> Matrix {
        self.layers.last().map_or(IDENTITY, |layer| layer.from_root)
    }

    /// Page base transform in the current device's space.
    fn device_base_transform(&self) -> Matrix {
        matrix::multiply(&self.top_from_root(), &self.base_transform)
    }

    /// Sets the current device transform to `m`, moving a suspended device
    /// by the same relative amount.
    fn set_transform(&mut self, root: &mut dyn Device, m: &Matrix) {
        let ctm = top_device(&mut self.layers, root).get_transform();
        match matrix::inverse(&ctm) {
            Some(inverse) => {
                let relative = matrix::multiply(&inverse, m);
                self.each_device(root, |device| device.concat_matrix(&relative));
            }
            None => top_device(&mut self.layers, root).set_matrix(m),
        }
    }

    fn apply_paint_state(&mut self, root: &mut dyn Device, alpha: f64) {
        let blend_mode = self.current.blend_mode;
        let device = top_device(&mut self.layers, root);
        device.set_global_alpha(alpha);
        device.set_blend_mode(blend_mode);
    }

    fn save(&mut self, root: &mut dyn Device) {
        self.each_device(root, |device| device.save_state());
        self.state_stack.push(self.current.clone());
    }

    fn restore(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let Some(previous) = self.state_stack.pop() else {
            if self.smask_mode().is_some() {
                self.end_smask_mode(root)?;
            }
            return Ok(());
        };
        self.current = previous;
        self.each_device(root, |device| device.restore_state());
        self.check_smask_state(root)?;
        self.pending_clip = None;
        Ok(())
    }

    // --- Paths ---

    fn move_to(&mut self, root: &mut dyn Device, x: f64, y: f64) {
        self.each_device(root, |device| device.move_to(x, y));
        self.current_point = (x, y);
        self.subpath_start = (x, y);
    }

    fn line_to(&mut self, root: &mut dyn Device, x: f64, y: f64) {
        self.each_device(root, |device| device.line_to(x, y));
        self.current_point = (x, y);
    }

    #[allow(clippy::too_many_arguments)]
    fn curve_to(&mut self, root: &mut dyn Device, x1: f64, y1: f64, x2: f64, y2: f64, x: f64, y: f64) {
        self.each_device(root, |device| device.curve_to(x1, y1, x2, y2, x, y));
        self.current_point = (x, y);
    }

    fn close_path(&mut self, root: &mut dyn Device) {
        self.each_device(root, |device| device.close_path());
        self.current_point = self.subpath_start;
    }

    fn rectangle(&mut self, root: &mut dyn Device, x: f64, y: f64, width: f64, height: f64) {
        self.each_device(root, |device| device.rect(x, y, width, height));
        self.current_point = (x, y);
        self.subpath_start = (x, y);
    }

    fn construct_path(&mut self, root: &mut dyn Device, args: &[OpArg]) -> PDFResult<()> {
        let ops = match arg(args, 0)? {
            OpArg::PathOps(ops) => ops.as_slice(),
            _ => return Err(PDFError::RenderingError("ConstructPath expects path ops".into())),
        };
        let coords = numbers_at(args, 1)?;
        let mut j = 0;

        for op in ops {
            match OpCode::from_id(*op) {
                Some(OpCode::MoveTo) => {
                    let c = take_coords(coords, &mut j, 2)?;
                    self.move_to(root, c[0], c[1]);
                }
                Some(OpCode::LineTo) => {
                    let c = take_coords(coords, &mut j, 2)?;
                    self.line_to(root, c[0], c[1]);
                }
                Some(OpCode::CurveTo) => {
                    let c = take_coords(coords, &mut j, 6)?;
                    self.curve_to(root, c[0], c[1], c[2], c[3], c[4], c[5]);
                }
                Some(OpCode::CurveTo2) => {
                    let c = take_coords(coords, &mut j, 4)?;
                    let (x1, y1) = self.current_point;
                    self.curve_to(root, x1, y1, c[0], c[1], c[2], c[3]);
                }
                Some(OpCode::CurveTo3) => {
                    let c = take_coords(coords, &mut j, 4)?;
                    self.curve_to(root, c[0], c[1], c[2], c[3], c[2], c[3]);
                }
                Some(OpCode::ClosePath) => self.close_path(root),
                Some(OpCode::Rectangle) => {
                    let c = take_coords(coords, &mut j, 4)?;
                    self.rectangle(root, c[0], c[1], c[2], c[3]);
                }
                _ => warn!(op, "Unknown path operator in ConstructPath"),
            }
        }
        Ok(())
    }

    /// Applies a pending clip and starts a new path.
    fn consume_path(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        if let Some(rule) = self.pending_clip.take() {
            let mut clipped = Ok(());
            self.each_device(root, |device| {
                if let Err(e) = device.clip_path(rule) {
                    clipped = Err(e);
                }
            });
            clipped?;
        }
        self.each_device(root, |device| device.begin_path());
        Ok(())
    }

    fn fill_path(&mut self, root: &mut dyn Device, rule: FillRule) -> PDFResult<()> {
        let source = self.current.fill.clone();
        let Some(paint) = self.make_paint(root, &source)? else {
            return Ok(());
        };
        let alpha = self.current.fill_alpha;
        self.apply_paint_state(root, alpha);
        top_device(&mut self.layers, root).draw_path(
            PathDrawMode::Fill(rule),
            &paint,
            &self.current.stroke_props,
        )
    }

    fn stroke_path(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let source = self.current.stroke.clone();
        let Some(paint) = self.make_paint(root, &source)? else {
            return Ok(());
        };
        let alpha = self.current.stroke_alpha;
        self.apply_paint_state(root, alpha);
        top_device(&mut self.layers, root).draw_path(
            PathDrawMode::Stroke,
            &paint,
            &self.current.stroke_props,
        )
    }

    // --- Paint ---

    /// `None` when the source cannot paint anything.
    fn make_paint(&mut self, root: &mut dyn Device, source: &ColorSource) -> PDFResult<Option<Paint>> {
        match source {
            ColorSource::Solid(color) => Ok(Some(Paint::Solid(*color))),
            ColorSource::Pattern(pattern) => match pattern.as_ref() {
                PatternIR::Shading(shading) => {
                    let pattern_matrix = shading.matrix.unwrap_or(IDENTITY);
                    let transform = matrix::multiply(&self.device_base_transform(), &pattern_matrix);
                    Ok(Some(gradient_paint(shading, transform)))
                }
                PatternIR::Tiling(tiling) => self.tiling_paint(root, tiling),
            },
        }
    }

    /// Renders one pattern cell off-surface and tiles it.
    fn tiling_paint(&mut self, root: &mut dyn Device, pattern: &TilingPatternIR) -> PDFResult<Option<Paint>> {
        let device_base = self.device_base_transform();
        let [x0, y0, x1, y1] = pattern.bbox;
        let matrix_scale = matrix::singular_value_scale(&pattern.matrix);
        let base_scale = matrix::singular_value_scale(&device_base);
        let (canvas_width, canvas_height) = {
            let device = top_device(&mut self.layers, root);
            (device.width(), device.height())
        };
        let (width, scale_x) =
            size_and_scale(pattern.x_step, canvas_width, matrix_scale.0 * base_scale.0);
        let (height, scale_y) =
            size_and_scale(pattern.y_step, canvas_height, matrix_scale.1 * base_scale.1);
        if !(scale_x.is_finite() && scale_y.is_finite()) || scale_x == 0.0 || scale_y == 0.0 {
            debug!("Skipping degenerate tiling pattern");
            return Ok(None);
        }

        let (mut adjusted_x0, mut adjusted_y0, mut adjusted_x1, mut adjusted_y1) = (x0, y0, x1, y1);
        if x0 < 0.0 {
            adjusted_x0 = 0.0;
            adjusted_x1 += x0.abs();
        }
        if y0 < 0.0 {
            adjusted_y0 = 0.0;
            adjusted_y1 += y0.abs();
        }

        let key = SurfaceKey::new(SurfacePurpose::TilingPattern, self.generation);
        let mut tile = {
            let factory = top_device(&mut self.layers, root);
            self.surfaces.take(key, width, height, &*factory)?
        };
        tile.set_matrix(&matrix::multiply(
            &matrix::translation(-(scale_x * adjusted_x0), -(scale_y * adjusted_y0)),
            &matrix::scaling(scale_x, scale_y),
        ));

        let mut child = RenderingContext::new(Arc::clone(&self.common_objs), Arc::clone(&self.objs));
        child.generation = self.generation + 1;
        child.group_level = self.group_level;
        child.surfaces = mem::take(&mut self.surfaces);
        let initial = match (pattern.paint_type, pattern.color) {
            (2, Some([r, g, b])) => ColorSource::Solid(Color::rgb(r, g, b)),
            _ => ColorSource::Solid(self.current.fill.solid_color().unwrap_or_else(Color::black)),
        };
        child.current.fill = initial.clone();
        child.current.stroke = initial;

        tile.save_state();
        tile.begin_path();
        tile.rect(
            adjusted_x0,
            adjusted_y0,
            adjusted_x1 - adjusted_x0,
            adjusted_y1 - adjusted_y0,
        );
        let clipped = tile.clip_path(FillRule::NonZero);
        tile.begin_path();
        child.base_transform = tile.get_transform();

        let outcome = clipped
            .and_then(|_| child.execute_nested(tile.as_mut(), &pattern.operator_list))
            .and_then(|_| child.finish(tile.as_mut()));
        self.surfaces = mem::take(&mut child.surfaces);
        let image = tile.get_image_data();
        self.surfaces.put(key, tile);
        outcome?;

        let transform = [
            &device_base,
            &pattern.matrix,
            &matrix::translation(adjusted_x0, adjusted_y0),
            &matrix::scaling(1.0 / scale_x, 1.0 / scale_y),
        ]
        .into_iter()
        .fold(IDENTITY, |acc, m| matrix::multiply(&acc, m));
        Ok(Some(Paint::Tiled {
            image: Arc::new(image),
            transform,
        }))
    }

    /// `sh`: paints a shading over the whole visible area.
    fn shading_fill(&mut self, root: &mut dyn Device, shading: &ShadingIR) -> PDFResult<()> {
        self.save(root);
        if let Some(shading_matrix) = shading.matrix {
            self.each_device(root, |device| device.concat_matrix(&shading_matrix));
        }
        if let Some([x0, y0, x1, y1]) = shading.bbox {
            self.each_device(root, |device| device.begin_path());
            self.rectangle(root, x0, y0, x1 - x0, y1 - y0);
            self.pending_clip = Some(FillRule::NonZero);
            self.consume_path(root)?;
        }

        let alpha = self.current.fill_alpha;
        self.apply_paint_state(root, alpha);
        let device = top_device(&mut self.layers, root);
        let ctm = device.get_transform();
        let painted = match matrix::inverse(&ctm) {
            Some(inverse) => {
                let canvas = [0.0, 0.0, f64::from(device.width()), f64::from(device.height())];
                let [x0, y0, x1, y1] = matrix::transform_bbox(&canvas, &inverse);
                device.begin_path();
                device.rect(x0, y0, x1 - x0, y1 - y0);
                let painted = device.draw_path(
                    PathDrawMode::Fill(FillRule::NonZero),
                    &gradient_paint(shading, ctm),
                    &StrokeProps::default(),
                );
                device.begin_path();
                painted
            }
            None => Ok(()),
        };
        self.restore(root)?;
        painted
    }

    // --- Graphics state dictionaries and soft masks ---

    fn set_gstate(&mut self, root: &mut dyn Device, entries: &[GStateEntry]) -> PDFResult<()> {
        for entry in entries {
            match entry {
                GStateEntry::LineWidth(width) => self.current.stroke_props.line_width = *width,
                GStateEntry::LineCap(cap) => self.current.stroke_props.line_cap = LineCap::from_u8(*cap),
                GStateEntry::LineJoin(join) => {
                    self.current.stroke_props.line_join = LineJoin::from_u8(*join)
                }
                GStateEntry::MiterLimit(limit) => self.current.stroke_props.miter_limit = *limit,
                GStateEntry::Dash(array, phase) => {
                    self.current.stroke_props.dash_array = array.clone();
                    self.current.stroke_props.dash_offset = *phase;
                }
                GStateEntry::RenderingIntent(_) | GStateEntry::Flatness(_) => {}
                GStateEntry::Font(name, size) => self.set_font(name, *size)?,
                GStateEntry::StrokeAlpha(alpha) => self.current.stroke_alpha = *alpha,
                GStateEntry::FillAlpha(alpha) => self.current.fill_alpha = *alpha,
                GStateEntry::BlendMode(name) => match BlendMode::from_name(name) {
                    Some(mode) => self.current.blend_mode = mode,
                    None => warn!(name = name.as_str(), "Unsupported blend mode"),
                },
                GStateEntry::SMask(active) => {
                    self.current.active_smask = if *active { self.temp_smask.take() } else { None };
                    self.temp_smask = None;
                    self.check_smask_state(root)?;
                }
            }
        }
        Ok(())
    }

    fn check_smask_state(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let active = self.current.active_smask.clone();
        let in_mode = self.smask_mode().cloned();
        match (active, in_mode) {
            (Some(active), Some(current)) if Arc::ptr_eq(&active, &current) => {}
            (Some(active), Some(_)) => {
                self.end_smask_mode(root)?;
                self.begin_smask_mode(root, active)?;
            }
            (Some(active), None) => self.begin_smask_mode(root, active)?,
            (None, Some(_)) => self.end_smask_mode(root)?,
            (None, None) => {}
        }
        Ok(())
    }

    fn begin_smask_mode(&mut self, root: &mut dyn Device, smask: Arc<SoftMask>) -> PDFResult<()> {
        let Some(to_layer) = matrix::inverse(&smask.placement()) else {
            warn!("Ignoring a soft mask with a degenerate placement");
            return Ok(());
        };
        let key = SurfaceKey::new(
            SurfacePurpose::SMaskGroup {
                level: self.group_level,
            },
            self.generation,
        );
        let from_root = matrix::multiply(&to_layer, &self.top_from_root());
        let (mut device, parent_ctm) = {
            let parent = top_device(&mut self.layers, root);
            let device = self
                .surfaces
                .take(key, smask.mask.width, smask.mask.height, &*parent)?;
            (device, parent.get_transform())
        };
        device.set_matrix(&matrix::multiply(&to_layer, &parent_ctm));
        self.layers.push(Layer {
            key,
            device,
            from_root,
            kind: LayerKind::SMaskMode(smask),
        });
        self.current.blend_mode = BlendMode::Normal;
        self.current.fill_alpha = 1.0;
        self.current.stroke_alpha = 1.0;
        Ok(())
    }

    /// Masks the content layer and draws it onto the device below.
    fn end_smask_mode(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let Some(layer) = self.layers.pop() else {
            return Ok(());
        };
        let LayerKind::SMaskMode(smask) = &layer.kind else {
            self.layers.push(layer);
            return Ok(());
        };
        let smask = Arc::clone(smask);
        let mut bitmap = layer.device.get_image_data();
        self.surfaces.put(layer.key, layer.device);
        smask.apply(&mut bitmap);

        let parent = top_device(&mut self.layers, root);
        parent.save_state();
        parent.set_matrix(&smask.placement());
        parent.set_global_alpha(1.0);
        parent.set_blend_mode(BlendMode::Normal);
        let drawn = parent.draw_image(&bitmap);
        parent.restore_state();
        drawn
    }

    // --- Groups, forms and annotations ---

    fn begin_group(&mut self, root: &mut dyn Device, group: &GroupOptions) -> PDFResult<()> {
        self.save(root);
        if self.smask_mode().is_some() {
            self.end_smask_mode(root)?;
            self.current.active_smask = None;
        }

        let parent_from_root = self.top_from_root();
        let parent = top_device(&mut self.layers, root);
        let current_transform = parent.get_transform();
        if let Some(group_matrix) = &group.matrix {
            parent.concat_matrix(group_matrix);
        }
        let bounds = matrix::transform_bbox(&group.bbox, &parent.get_transform());
        let canvas = [0.0, 0.0, f64::from(parent.width()), f64::from(parent.height())];
        let bounds = matrix::intersect(&bounds, &canvas).unwrap_or([0.0; 4]);
        let offset_x = bounds[0].floor();
        let offset_y = bounds[1].floor();
        let mut drawn_width = (bounds[2].ceil() - offset_x).max(1.0);
        let mut drawn_height = (bounds[3].ceil() - offset_y).max(1.0);
        let max_size = f64::from(MAX_GROUP_SIZE);
        let (mut scale_x, mut scale_y) = (1.0, 1.0);
        if drawn_width > max_size {
            scale_x = drawn_width / max_size;
            drawn_width = max_size;
        }
        if drawn_height > max_size {
            scale_y = drawn_height / max_size;
            drawn_height = max_size;
        }

        let purpose = if group.smask.is_some() {
            let slot = self.smask_counter % 2;
            self.smask_counter += 1;
            SurfacePurpose::SoftMask {
                level: self.group_level,
                slot,
            }
        } else {
            SurfacePurpose::Group {
                level: self.group_level,
            }
        };
        let key = SurfaceKey::new(purpose, self.generation);
        let mut device = self
            .surfaces
            .take(key, drawn_width as u32, drawn_height as u32, &*parent)?;

        let group_map = matrix::multiply(
            &matrix::scaling(1.0 / scale_x, 1.0 / scale_y),
            &matrix::translation(-offset_x, -offset_y),
        );
        device.set_matrix(&matrix::multiply(&group_map, &current_transform));
        if group.smask.is_none() {
            // Where the finished group is drawn on the parent.
            parent.set_matrix(&matrix::multiply(
                &matrix::translation(offset_x, offset_y),
                &matrix::scaling(scale_x, scale_y),
            ));
            parent.save_state();
        }
        if group.knockout {
            warn!("Knockout groups not supported.");
        }

        self.layers.push(Layer {
            key,
            device,
            from_root: matrix::multiply(&group_map, &parent_from_root),
            kind: LayerKind::Group {
                smask: group.smask.clone(),
                offset_x,
                offset_y,
                scale_x,
                scale_y,
            },
        });
        self.current.blend_mode = BlendMode::Normal;
        self.current.fill_alpha = 1.0;
        self.current.stroke_alpha = 1.0;
        self.group_level += 1;
        Ok(())
    }

    fn end_group(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        if !matches!(
            self.layers.last(),
            Some(Layer {
                kind: LayerKind::Group { .. },
                ..
            })
        ) {
            warn!("EndGroup without a matching BeginGroup");
            return Ok(());
        }
        let Some(layer) = self.layers.pop() else {
            return Ok(());
        };
        self.group_level = self.group_level.saturating_sub(1);
        let bitmap = layer.device.get_image_data();
        self.surfaces.put(layer.key, layer.device);
        let LayerKind::Group {
            smask,
            offset_x,
            offset_y,
            scale_x,
            scale_y,
        } = layer.kind
        else {
            return Ok(());
        };

        if let Some(options) = smask {
            self.temp_smask = Some(Arc::new(SoftMask {
                mask: bitmap,
                offset_x,
                offset_y,
                scale_x,
                scale_y,
                subtype: options.subtype,
                backdrop: options.backdrop,
                transfer_map: options.transfer_map,
            }));
            return self.restore(root);
        }

        let parent_from_root = self.top_from_root();
        let placement = {
            let parent = top_device(&mut self.layers, root);
            parent.restore_state();
            parent.get_transform()
        };
        self.restore(root)?;

        // The restore may have switched to a soft-mask layer.
        let to_top = matrix::inverse(&parent_from_root)
            .map(|inverse| matrix::multiply(&self.top_from_root(), &inverse))
            .unwrap_or(IDENTITY);
        let alpha = self.current.fill_alpha;
        self.apply_paint_state(root, alpha);
        let device = top_device(&mut self.layers, root);
        device.save_state();
        device.set_matrix(&matrix::multiply(&to_top, &placement));
        let drawn = device.draw_image(&bitmap);
        device.restore_state();
        drawn
    }

    fn paint_form_begin(
        &mut self,
        root: &mut dyn Device,
        form_matrix: Option<Matrix>,
        bbox: Option<[f64; 4]>,
    ) -> PDFResult<()> {
        self.save(root);
        self.base_transform_stack.push(self.base_transform);
        if let Some(form_matrix) = form_matrix {
            self.each_device(root, |device| device.concat_matrix(&form_matrix));
        }
        let ctm = top_device(&mut self.layers, root).get_transform();
        self.base_transform = match matrix::inverse(&self.top_from_root()) {
            Some(to_root) => matrix::multiply(&to_root, &ctm),
            None => ctm,
        };
        if let Some([x0, y0, x1, y1]) = bbox {
            self.rectangle(root, x0, y0, x1 - x0, y1 - y0);
            self.pending_clip = Some(FillRule::NonZero);
            self.consume_path(root)?;
        }
        Ok(())
    }

    fn begin_annotation(&mut self, root: &mut dyn Device, args: &[OpArg]) -> PDFResult<()> {
        self.save(root);
        if let Some([x0, y0, x1, y1]) = fixed_numbers::<4>(args, 1) {
            self.each_device(root, |device| device.begin_path());
            self.rectangle(root, x0, y0, x1 - x0, y1 - y0);
            self.pending_clip = Some(FillRule::NonZero);
            self.consume_path(root)?;
        }
        let active_smask = self.current.active_smask.take();
        self.current = GraphicsState::default();
        self.current.active_smask = active_smask;
        for index in [2, 3] {
            if let Some(m) = fixed_numbers::<6>(args, index) {
                self.each_device(root, |device| device.concat_matrix(&m));
            }
        }
        Ok(())
    }

    // --- Text ---

    fn set_font(&mut self, name: &str, size: f64) -> PDFResult<()> {
        let font = match self.common_objs.get(name)? {
            PoolObject::Font(font) => font,
            _ => {
                return Err(PDFError::RenderingError(format!(
                    "Can't find font for {}",
                    name
                )));
            }
        };
        let font_matrix = font.font_matrix();
        if font_matrix[0] == 0.0 || font_matrix[3] == 0.0 {
            warn!(name, "Invalid font matrix");
        }
        self.current.font_matrix = font_matrix;
        if size < 0.0 {
            self.current.font_size = -size;
            self.current.font_direction = -1.0;
        } else {
            self.current.font_size = size;
            self.current.font_direction = 1.0;
        }
        self.current.font = Some(font);
        Ok(())
    }

    fn show_text(&mut self, root: &mut dyn Device, glyphs: &[GlyphItem]) -> PDFResult<()> {
        let Some(font) = self.current.font.clone() else {
            warn!("ShowText without a font");
            return Ok(());
        };
        if font.is_type3() {
            return self.show_type3_text(root, &font, glyphs);
        }

        let font_size = self.current.font_size;
        if font_size == 0.0 {
            return Ok(());
        }
        let direction = self.current.font_direction;
        let h_scale = self.current.text_h_scale * direction;
        let vertical = font.data.vertical;
        let spacing_dir = if vertical { 1.0 } else { -1.0 };
        let char_spacing = self.current.char_spacing;
        let word_spacing = self.current.word_spacing;
        let width_advance_scale = font_size * self.current.font_matrix[0];
        let mode = self.current.text_rendering_mode;
        let text_to_user = [
            &self.current.text_matrix,
            &matrix::translation(self.current.x, self.current.y + self.current.text_rise),
            &matrix::scaling(h_scale, -direction),
        ]
        .into_iter()
        .fold(IDENTITY, |acc, m| matrix::multiply(&acc, m));
        let glyph_scale = matrix::multiply(
            &matrix::scaling(font_size, -font_size),
            &self.current.font_matrix,
        );

        let fill_paint = if mode.fills() {
            let source = self.current.fill.clone();
            self.make_paint(root, &source)?
        } else {
            None
        };
        let stroke_paint = if mode.strokes() {
            let source = self.current.stroke.clone();
            self.make_paint(root, &source)?
        } else {
            None
        };
        let paints = fill_paint.is_some() || stroke_paint.is_some();
        if fill_paint.is_some() {
            let alpha = self.current.fill_alpha;
            self.apply_paint_state(root, alpha);
        } else if stroke_paint.is_some() {
            let alpha = self.current.stroke_alpha;
            self.apply_paint_state(root, alpha);
        }

        let mut x = 0.0;
        for item in glyphs {
            let glyph = match item {
                GlyphItem::Spacing(adjustment) => {
                    x += spacing_dir * adjustment * font_size / 1000.0;
                    continue;
                }
                GlyphItem::Glyph(glyph) => glyph,
            };
            let spacing = if glyph.is_space { word_spacing } else { 0.0 } + char_spacing;
            let (origin, char_width) = if vertical {
                let (vx, vy, width) = match glyph.vmetric {
                    Some([w1y, vx, vy]) => (-vx * width_advance_scale, vy * width_advance_scale, -w1y),
                    None => (-glyph.width * 0.5 * width_advance_scale, 0.0, glyph.width),
                };
                ((vx, x + vy), width * width_advance_scale - spacing * direction)
            } else {
                ((x, 0.0), glyph.width * width_advance_scale + spacing * direction)
            };

            if (paints || mode.adds_to_path()) && (glyph.is_in_font || font.data.missing_file) {
                let glyph_to_user = matrix::multiply(
                    &text_to_user,
                    &matrix::multiply(&matrix::translation(origin.0, origin.1), &glyph_scale),
                );
                let outline = if font.has_outlines() {
                    match self.common_objs.get(&font.glyph_path_id(glyph)) {
                        Ok(PoolObject::FontPath(commands)) => Some(commands),
                        _ => None,
                    }
                } else {
                    None
                };

                match outline {
                    Some(commands) => {
                        let user_path = transform_commands(&commands, &glyph_to_user);
                        let device = top_device(&mut self.layers, root);
                        for (paint, draw_mode) in [
                            (&fill_paint, PathDrawMode::Fill(FillRule::NonZero)),
                            (&stroke_paint, PathDrawMode::Stroke),
                        ] {
                            if let Some(paint) = paint {
                                device.begin_path();
                                add_commands(device, &user_path);
                                device.draw_path(draw_mode, paint, &self.current.stroke_props)?;
                            }
                        }
                        device.begin_path();
                        if mode.adds_to_path() {
                            self.pending_text_paths
                                .get_or_insert_with(Vec::new)
                                .extend(user_path);
                        }
                    }
                    None => {
                        if let Some(paint) = &fill_paint {
                            let text = if glyph.unicode.is_empty() {
                                &glyph.font_char
                            } else {
                                &glyph.unicode
                            };
                            let placement = matrix::multiply(
                                &text_to_user,
                                &matrix::translation(origin.0, origin.1),
                            );
                            let device = top_device(&mut self.layers, root);
                            device.save_state();
                            device.concat_matrix(&placement);
                            let drawn = device.fill_text(text, font.family(), font_size, paint);
                            device.restore_state();
                            drawn?;
                        } else if mode.adds_to_path() {
                            debug!(glyph = glyph.font_char.as_str(), "No outline to clip with");
                        }
                    }
                }
            }
            x += char_width;
        }

        if vertical {
            self.current.y -= x;
        } else {
            self.current.x += x * h_scale;
        }
        Ok(())
    }

    /// Runs each glyph's own operator list.
    fn show_type3_text(
        &mut self,
        root: &mut dyn Device,
        font: &Arc<FontResource>,
        glyphs: &[GlyphItem],
    ) -> PDFResult<()> {
        let font_size = self.current.font_size;
        if self.current.text_rendering_mode == TextRenderingMode::Invisible || font_size == 0.0 {
            return Ok(());
        }
        let direction = self.current.font_direction;
        let h_scale = self.current.text_h_scale * direction;
        let spacing_dir = if font.data.vertical { 1.0 } else { -1.0 };
        let char_spacing = self.current.char_spacing;
        let word_spacing = self.current.word_spacing;
        let font_matrix = self.current.font_matrix;

        let setup = [
            self.current.text_matrix,
            matrix::translation(self.current.x, self.current.y),
            matrix::scaling(h_scale, direction),
        ];
        self.each_device(root, |device| {
            device.save_state();
            for m in &setup {
                device.concat_matrix(m);
            }
        });

        let mut outcome = Ok(());
        for item in glyphs {
            match item {
                GlyphItem::Spacing(adjustment) => {
                    let length = spacing_dir * adjustment * font_size / 1000.0;
                    self.each_device(root, |device| {
                        device.concat_matrix(&matrix::translation(length, 0.0))
                    });
                    self.current.x += length * h_scale;
                }
                GlyphItem::Glyph(glyph) => {
                    let spacing = if glyph.is_space { word_spacing } else { 0.0 } + char_spacing;
                    let Some(operator_list) = font.char_proc(glyph) else {
                        warn!(
                            id = glyph.operator_list_id.as_deref().unwrap_or(""),
                            "Type3 character is not available."
                        );
                        continue;
                    };
                    self.save(root);
                    self.each_device(root, |device| {
                        device.concat_matrix(&matrix::scaling(font_size, font_size));
                        device.concat_matrix(&font_matrix);
                    });
                    let executed = self.execute_nested(root, operator_list);
                    let restored = self.restore(root);
                    if let Err(e) = executed.and(restored) {
                        outcome = Err(e);
                        break;
                    }
                    let (advance, _) = matrix::apply(&font_matrix, glyph.width, 0.0);
                    let width = advance * font_size + spacing;
                    self.each_device(root, |device| {
                        device.concat_matrix(&matrix::translation(width, 0.0))
                    });
                    self.current.x += width * h_scale;
                }
            }
        }

        self.each_device(root, |device| device.restore_state());
        outcome
    }

    /// Clips to the outlines collected by clipping text modes.
    fn end_text(&mut self, root: &mut dyn Device) -> PDFResult<()> {
        let Some(paths) = self.pending_text_paths.take() else {
            self.each_device(root, |device| device.begin_path());
            return Ok(());
        };
        self.each_device(root, |device| {
            device.begin_path();
            add_commands(device, &paths);
        });
        self.pending_clip = Some(FillRule::NonZero);
        self.consume_path(root)
    }

    // --- Images ---

    fn image_arg(&self, arg: &OpArg) -> PDFResult<Option<Arc<ImageBitmap>>> {
        match arg {
            OpArg::Name(id) => match self.pool_for(id).get(id) {
                Ok(PoolObject::Image(image)) => Ok(Some(image)),
                Ok(_) => Err(PDFError::RenderingError(format!("Object {} is not an image", id))),
                Err(PDFError::ObjectNotResolved(_)) => {
                    warn!(id = id.as_str(), "Dependent image isn't ready yet");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            OpArg::Image(payload) => Ok(Some(Arc::new(payload.to_bitmap()?))),
            _ => Err(PDFError::RenderingError("Expected an image argument".into())),
        }
    }

    fn mask_color(&self) -> [u8; 4] {
        match &self.current.fill {
            ColorSource::Solid(color) => color.rgba(),
            ColorSource::Pattern(_) => {
                debug!("Pattern-filled image masks are painted black");
                Color::black().rgba()
            }
        }
    }

    /// Draws `image` into the unit square of user space, optionally placed
    /// by `transform` first.
    fn draw_image(
        &mut self,
        root: &mut dyn Device,
        image: &ImageBitmap,
        transform: Option<&Matrix>,
    ) -> PDFResult<()> {
        if image.width == 0 || image.height == 0 {
            return Ok(());
        }
        let alpha = self.current.fill_alpha;
        self.apply_paint_state(root, alpha);
        let device = top_device(&mut self.layers, root);
        device.save_state();
        if let Some(transform) = transform {
            device.concat_matrix(transform);
        }
        device.concat_matrix(&image_to_unit(image.width, image.height));
        let drawn = device.draw_image(image);
        device.restore_state();
        drawn
    }

    fn paint_inline_image_group(
        &mut self,
        root: &mut dyn Device,
        image: &ImageBitmap,
        map: &[InlineImagePlacement],
    ) -> PDFResult<()> {
        for entry in map {
            let whole = entry.x == 0
                && entry.y == 0
                && entry.w == image.width
                && entry.h == image.height;
            if whole {
                self.draw_image(root, image, Some(&entry.transform))?;
            } else if let Some(part) = crop_bitmap(image, entry) {
                self.draw_image(root, &part, Some(&entry.transform))?;
            } else {
                warn!("Inline image placement outside the image");
            }
        }
        Ok(())
    }

    fn paint_image_mask_group(&mut self, root: &mut dyn Device, group: &[MaskPlacement]) -> PDFResult<()> {
        let color = self.mask_color();
        for placement in group {
            let bitmap = placement.mask.to_bitmap(color)?;
            self.draw_image(root, &bitmap, Some(&placement.transform))?;
        }
        Ok(())
    }
}

fn take_coords<'a>(coords: &'a [f64], j: &mut usize, count: usize) -> PDFResult<&'a [f64]> {
    let values = coords
        .get(*j..*j + count)
        .ok_or_else(|| PDFError::RenderingError("ConstructPath ran out of coordinates".into()))?;
    *j += count;
    Ok(values)
}

fn glyphs_arg(args: &[OpArg], index: usize) -> PDFResult<&[GlyphItem]> {
    match arg(args, index)? {
        OpArg::Glyphs(glyphs) => Ok(glyphs),
        _ => Err(PDFError::RenderingError("Expected glyphs".into())),
    }
}

fn color_source(args: &[OpArg]) -> PDFResult<ColorSource> {
    if let Some(OpArg::Pattern(pattern)) = args.first() {
        return Ok(ColorSource::Pattern(Arc::new(pattern.as_ref().clone())));
    }
    let components: Vec<f64> = match args.first() {
        Some(OpArg::Numbers(values)) => values.clone(),
        _ => args.iter().filter_map(OpArg::as_f64).collect(),
    };
    Color::from_components(&components)
        .map(ColorSource::Solid)
        .ok_or_else(|| {
            PDFError::RenderingError(format!(
                "Unsupported color with {} components",
                components.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::font::{FontData, Glyph};
    use crate::core::operator_list::{OpArgs, SMaskSubtype, numbers};
    use crate::rendering::device::TestDevice;
    use crate::rendering::skia_device::SkiaDevice;
    use crate::rendering::viewport::ViewportParameters;
    use smallvec::smallvec;

    fn context() -> RenderingContext {
        RenderingContext::new(Arc::new(PDFObjects::new()), Arc::new(PDFObjects::new()))
    }

    fn viewport(size: f64) -> PageViewport {
        PageViewport::new(ViewportParameters {
            view_box: [0.0, 0.0, size, size],
            ..Default::default()
        })
        .unwrap()
    }

    fn fill_rect(list: &mut OperatorList, rgb: [f64; 3], rect: [f64; 4]) {
        list.add_op(OpCode::SetFillRGBColor, numbers(&rgb));
        list.add_op(OpCode::Rectangle, numbers(&rect));
        list.add_op(OpCode::Fill, OpArgs::new());
    }

    fn run(context: &mut RenderingContext, device: &mut dyn Device, list: &OperatorList) {
        context.begin_drawing(device, &viewport(10.0), None, None, false).unwrap();
        let step = context.execute_operator_list(device, list, 0, false).unwrap();
        assert!(matches!(step, Step::Done(n) if n == list.len()));
        context.end_drawing(device).unwrap();
    }

    #[test]
    fn test_crop_bitmap_rejects_out_of_bounds_placements() {
        let image = ImageBitmap {
            width: 4,
            height: 2,
            data: (0u8..32).collect::<Vec<u8>>().into(),
        };
        let placement = |x, y, w, h| InlineImagePlacement {
            transform: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            x,
            y,
            w,
            h,
        };

        let part = crop_bitmap(&image, &placement(1, 1, 2, 1)).unwrap();
        assert_eq!((part.width, part.height), (2, 1));
        assert_eq!(&part.data[..], &[20, 21, 22, 23, 24, 25, 26, 27]);

        assert!(crop_bitmap(&image, &placement(3, 0, 2, 1)).is_none());
        assert!(crop_bitmap(&image, &placement(u32::MAX, 0, 2, 1)).is_none());
        assert!(crop_bitmap(&image, &placement(0, 1, 1, u32::MAX)).is_none());
        assert!(crop_bitmap(&image, &placement(0, 0, 0, 1)).is_none());
    }

    #[test]
    fn test_fill_reaches_device() {
        let mut list = OperatorList::new();
        fill_rect(&mut list, [1.0, 0.0, 0.0], [0.0, 0.0, 5.0, 5.0]);

        let mut device = TestDevice::new(10, 10);
        run(&mut context(), &mut device, &list);

        // Page space is y-up, so the square lands in the bottom-left corner.
        assert_eq!(device.pixel(2, 8), [255, 0, 0, 255]);
        assert_eq!(device.pixel(8, 2), [255, 255, 255, 255]);
        assert!(device
            .operations()
            .contains(&"draw_path(fill, NonZero)".to_string()));
    }

    #[test]
    fn test_unknown_opcode_is_skipped() {
        let mut list = OperatorList::new();
        list.fn_array.push(200);
        list.args_array.push(OpArgs::new());
        fill_rect(&mut list, [0.0, 0.0, 1.0], [0.0, 0.0, 10.0, 10.0]);

        let mut device = TestDevice::new(10, 10);
        run(&mut context(), &mut device, &list);
        assert_eq!(device.pixel(5, 5), [0, 0, 255, 255]);
    }

    #[test]
    fn test_end_drawing_unwinds_saves() {
        let mut list = OperatorList::new();
        list.add_op(OpCode::Save, OpArgs::new());
        list.add_op(OpCode::Save, OpArgs::new());
        list.add_op(OpCode::Transform, numbers(&[2.0, 0.0, 0.0, 2.0, 0.0, 0.0]));

        let mut device = TestDevice::new(10, 10);
        let mut context = context();
        context.begin_drawing(&mut device, &viewport(10.0), None, None, false).unwrap();
        context.execute_operator_list(&mut device, &list, 0, true).unwrap();
        assert_eq!(context.state_depth(), 2);
        context.end_drawing(&mut device).unwrap();
        assert_eq!(context.state_depth(), 0);
        assert_eq!(device.get_transform(), IDENTITY);
    }

    #[tokio::test]
    async fn test_dependency_blocks_until_resolved() {
        let objs = Arc::new(PDFObjects::new());
        let mut context = RenderingContext::new(Arc::new(PDFObjects::new()), Arc::clone(&objs));
        let mut list = OperatorList::new();
        list.add_dependency("img_p0_1");
        list.add_op(OpCode::PaintImageXObject, smallvec![OpArg::Name("img_p0_1".into())]);

        let mut device = TestDevice::new(10, 10);
        context.begin_drawing(&mut device, &viewport(10.0), None, None, false).unwrap();
        let step = context.execute_operator_list(&mut device, &list, 0, true).unwrap();
        let (index, pending) = match step {
            Step::Blocked { index, pending } => (index, pending),
            other => panic!("expected a dependency stall, got {:?}", other),
        };
        assert_eq!(index, 0);

        objs.resolve(
            "img_p0_1",
            PoolObject::Image(Arc::new(ImageBitmap {
                width: 1,
                height: 1,
                data: vec![0, 255, 0, 255].into(),
            })),
        );
        pending.await.unwrap();
        let step = context.execute_operator_list(&mut device, &list, index, true).unwrap();
        assert!(matches!(step, Step::Done(2)));
        assert!(device
            .operations()
            .iter()
            .any(|op| op.starts_with("draw_image(1x1")));
        // The unit square of page space is the bottom-left pixel.
        assert_eq!(device.pixel(0, 9), [0, 255, 0, 255]);
    }

    #[test]
    fn test_resume_past_end_is_done() {
        let mut list = OperatorList::new();
        list.add_op(OpCode::Save, OpArgs::new());
        let mut device = TestDevice::new(4, 4);
        let step = context().execute_operator_list(&mut device, &list, 1, true).unwrap();
        assert!(matches!(step, Step::Done(1)));
    }

    #[test]
    fn test_transparency_group_composites_onto_parent() {
        let mut list = OperatorList::new();
        list.add_op(
            OpCode::BeginGroup,
            smallvec![OpArg::Group(Box::new(GroupOptions {
                matrix: None,
                bbox: [0.0, 0.0, 10.0, 10.0],
                smask: None,
                isolated: true,
                knockout: false,
            }))],
        );
        fill_rect(&mut list, [1.0, 0.0, 0.0], [0.0, 0.0, 5.0, 5.0]);
        list.add_op(OpCode::EndGroup, OpArgs::new());

        let mut device = TestDevice::new(10, 10);
        let mut context = context();
        run(&mut context, &mut device, &list);
        assert_eq!(device.pixel(2, 8), [255, 0, 0, 255]);
        assert_eq!(device.pixel(8, 2), [255, 255, 255, 255]);
        assert_eq!(context.group_level, 0);
    }

    #[test]
    fn test_luminosity_soft_mask_hides_dark_areas() {
        let mut list = OperatorList::new();
        // Mask: white on the right half, nothing on the left.
        list.add_op(
            OpCode::BeginGroup,
            smallvec![OpArg::Group(Box::new(GroupOptions {
                matrix: None,
                bbox: [0.0, 0.0, 10.0, 10.0],
                smask: Some(SMaskOptions {
                    subtype: SMaskSubtype::Luminosity,
                    backdrop: None,
                    transfer_map: None,
                }),
                isolated: true,
                knockout: false,
            }))],
        );
        fill_rect(&mut list, [1.0, 1.0, 1.0], [5.0, 0.0, 5.0, 10.0]);
        list.add_op(OpCode::EndGroup, OpArgs::new());

        list.add_op(OpCode::Save, OpArgs::new());
        list.add_op(OpCode::SetGState, smallvec![OpArg::GState(vec![GStateEntry::SMask(true)])]);
        fill_rect(&mut list, [1.0, 0.0, 0.0], [0.0, 0.0, 10.0, 10.0]);
        list.add_op(OpCode::Restore, OpArgs::new());

        let mut device = TestDevice::new(10, 10);
        let mut context = context();
        run(&mut context, &mut device, &list);
        assert_eq!(device.pixel(2, 5), [255, 255, 255, 255]);
        assert_eq!(device.pixel(7, 5), [255, 0, 0, 255]);
        assert!(context.layers.is_empty());
    }

    #[test]
    fn test_tiling_pattern_fill() {
        let mut cell = OperatorList::new();
        fill_rect(&mut cell, [1.0, 0.0, 0.0], [0.0, 0.0, 10.0, 10.0]);
        let pattern = PatternIR::Tiling(TilingPatternIR {
            operator_list: cell,
            matrix: IDENTITY,
            bbox: [0.0, 0.0, 10.0, 10.0],
            x_step: 10.0,
            y_step: 10.0,
            paint_type: 1,
            color: None,
        });

        let mut list = OperatorList::new();
        list.add_op(OpCode::SetFillColorN, smallvec![OpArg::Pattern(Box::new(pattern))]);
        list.add_op(OpCode::Rectangle, numbers(&[0.0, 0.0, 20.0, 20.0]));
        list.add_op(OpCode::Fill, OpArgs::new());

        let mut device = SkiaDevice::new(20, 20).unwrap();
        let mut context = context();
        context.begin_drawing(&mut device, &viewport(20.0), None, None, false).unwrap();
        context.execute_operator_list(&mut device, &list, 0, false).unwrap();
        context.end_drawing(&mut device).unwrap();

        let data = device.get_image_data();
        let pixel = |x: usize, y: usize| data.data[(y * 20 + x) * 4..(y * 20 + x) * 4 + 4].to_vec();
        assert_eq!(pixel(5, 5), vec![255, 0, 0, 255]);
        assert_eq!(pixel(15, 15), vec![255, 0, 0, 255]);
    }

    #[test]
    fn test_size_and_scale_caps_large_cells() {
        assert_eq!(size_and_scale(10.0, 100, 1.5), (15, 1.5));
        let (size, scale) = size_and_scale(10_000.0, 100, 1.0);
        assert_eq!(size, MAX_PATTERN_SIZE);
        assert_eq!(scale, 1.0);
    }

    fn glyph(ch: &str, width: f64) -> Glyph {
        Glyph {
            font_char: ch.to_string(),
            unicode: ch.to_string(),
            width,
            is_in_font: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_text_falls_back_to_host_font_and_advances() {
        let common_objs = Arc::new(PDFObjects::new());
        common_objs.resolve(
            "g_font_1",
            PoolObject::Font(Arc::new(FontResource::from_error("g_font_1"))),
        );
        let mut context = RenderingContext::new(common_objs, Arc::new(PDFObjects::new()));

        let mut list = OperatorList::new();
        list.add_op(OpCode::BeginText, OpArgs::new());
        list.add_op(
            OpCode::SetFont,
            smallvec![OpArg::Name("g_font_1".into()), OpArg::Number(10.0)],
        );
        list.add_op(
            OpCode::ShowText,
            smallvec![OpArg::Glyphs(vec![
                GlyphItem::Glyph(glyph("A", 500.0)),
                GlyphItem::Spacing(-100.0),
                GlyphItem::Glyph(glyph("B", 500.0)),
            ])],
        );

        let mut device = TestDevice::new(10, 10);
        context.begin_drawing(&mut device, &viewport(10.0), None, None, false).unwrap();
        context.execute_operator_list(&mut device, &list, 0, false).unwrap();

        // 500/1000 * 10 per glyph plus 100/1000 * 10 of spacing.
        assert!((context.current_state().x - 11.0).abs() < 1e-9);
        let texts: Vec<_> = device
            .operations()
            .iter()
            .filter(|op| op.starts_with("fill_text"))
            .cloned()
            .collect();
        assert_eq!(
            texts,
            vec![
                "fill_text(sans-serif, 10, \"A\")".to_string(),
                "fill_text(sans-serif, 10, \"B\")".to_string(),
            ]
        );
    }

    #[test]
    fn test_type3_glyph_runs_char_proc() {
        let mut char_proc = OperatorList::new();
        fill_rect(&mut char_proc, [0.0, 0.0, 0.0], [0.0, 0.0, 1000.0, 1000.0]);
        let mut data = FontData {
            loaded_name: "g_t3".to_string(),
            is_type3: true,
            ..Default::default()
        };
        data.char_procs.insert("a".to_string(), char_proc);
        let font = FontResource::load(data).unwrap();

        let common_objs = Arc::new(PDFObjects::new());
        common_objs.resolve("g_t3", PoolObject::Font(Arc::new(font)));
        let mut context = RenderingContext::new(common_objs, Arc::new(PDFObjects::new()));

        let mut list = OperatorList::new();
        list.add_op(OpCode::BeginText, OpArgs::new());
        list.add_op(
            OpCode::SetFont,
            smallvec![OpArg::Name("g_t3".into()), OpArg::Number(2.0)],
        );
        let mut glyph = glyph("a", 1000.0);
        glyph.operator_list_id = Some("a".to_string());
        list.add_op(OpCode::ShowText, smallvec![OpArg::Glyphs(vec![GlyphItem::Glyph(glyph)])]);
        list.add_op(OpCode::EndText, OpArgs::new());

        let mut device = TestDevice::new(10, 10);
        run(&mut context, &mut device, &list);
        // A 1000-unit glyph at size 2 covers two user units.
        assert_eq!(device.pixel(1, 9), [0, 0, 0, 255]);
        assert_eq!(device.pixel(3, 9), [255, 255, 255, 255]);
    }

    #[test]
    fn test_missing_argument_is_an_error() {
        let mut list = OperatorList::new();
        list.add_op(OpCode::SetLineWidth, OpArgs::new());
        let mut device = TestDevice::new(4, 4);
        let result = context().execute_operator_list(&mut device, &list, 0, false);
        assert!(matches!(result, Err(PDFError::RenderingError(_))));
    }

    #[test]
    fn test_image_mask_uses_fill_color() {
        let mut list = OperatorList::new();
        list.add_op(OpCode::SetFillRGBColor, numbers(&[0.0, 0.0, 1.0]));
        list.add_op(OpCode::Transform, numbers(&[10.0, 0.0, 0.0, 10.0, 0.0, 0.0]));
        list.add_op(
            OpCode::PaintImageMaskXObject,
            smallvec![OpArg::ImageMask(Box::new(crate::core::image::ImageMask {
                width: 2,
                height: 1,
                // Left pixel painted, right pixel transparent.
                data: vec![0b0100_0000].into(),
            }))],
        );

        let mut device = TestDevice::new(10, 10);
        run(&mut context(), &mut device, &list);
        assert_eq!(device.pixel(2, 5), [0, 0, 255, 255]);
        assert_eq!(device.pixel(7, 5), [255, 255, 255, 255]);
    }
}
