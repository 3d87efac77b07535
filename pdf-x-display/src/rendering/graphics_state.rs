//! Graphics state management for operator-list rendering.
//!
//! The interpreter keeps a stack of [`GraphicsState`] values: `Save` pushes
//! a copy of the top, `Restore` pops it. The current transformation matrix
//! lives on the device, everything else lives here.

use std::sync::Arc;

use crate::core::font::{FONT_IDENTITY_MATRIX, FontResource};
use crate::core::operator_list::PatternIR;

use super::matrix::{IDENTITY, Matrix};
use super::smask::SoftMask;

/// Line cap style (ISO 32000-1, 8.4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineCap {
    /// Butt cap (default) - stroke is squared off at the endpoint
    #[default]
    Butt = 0,
    /// Round cap - semicircular arc with center at endpoint
    Round = 1,
    /// Projecting square cap - stroke continues beyond endpoint
    ProjectingSquare = 2,
}

impl LineCap {
    pub fn from_u8(value: u8) -> LineCap {
        match value {
            1 => LineCap::Round,
            2 => LineCap::ProjectingSquare,
            _ => LineCap::Butt,
        }
    }
}

/// Line join style (ISO 32000-1, 8.4.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineJoin {
    /// Miter join (default) - outer edges meet at a sharp point
    #[default]
    Miter = 0,
    /// Round join - circular arc between the edges
    Round = 1,
    /// Bevel join - outer edges meet at a beveled edge
    Bevel = 2,
}

impl LineJoin {
    pub fn from_u8(value: u8) -> LineJoin {
        match value {
            1 => LineJoin::Round,
            2 => LineJoin::Bevel,
            _ => LineJoin::Miter,
        }
    }
}

/// Stroke properties for path rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeProps {
    /// Line width in user space units (default: 1.0)
    pub line_width: f64,

    /// Line cap style (default: Butt)
    pub line_cap: LineCap,

    /// Line join style (default: Miter)
    pub line_join: LineJoin,

    /// Miter limit (default: 10.0)
    pub miter_limit: f64,

    /// Dash pattern - array of dash lengths alternating on/off
    pub dash_array: Vec<f64>,

    /// Dash phase - offset into the dash pattern (default: 0)
    pub dash_offset: f64,
}

impl Default for StrokeProps {
    fn default() -> Self {
        StrokeProps {
            line_width: 1.0,
            line_cap: LineCap::default(),
            line_join: LineJoin::default(),
            miter_limit: 10.0,
            dash_array: Vec::new(),
            dash_offset: 0.0,
        }
    }
}

/// Color in a device color space, components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Color {
    /// Grayscale color (1 component: 0.0 = black, 1.0 = white)
    Gray(f64),
    RGB(f64, f64, f64),
    CMYK(f64, f64, f64, f64),
}

impl Color {
    /// Black, the initial stroke and fill color.
    pub fn black() -> Self {
        Color::Gray(0.0)
    }

    pub fn white() -> Self {
        Color::Gray(1.0)
    }

    /// Create an RGB color from u8 values (0-255).
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color::RGB(r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0)
    }

    /// Picks the color space from the number of components.
    pub fn from_components(components: &[f64]) -> Option<Self> {
        match *components {
            [g] => Some(Color::Gray(g)),
            [r, g, b] => Some(Color::RGB(r, g, b)),
            [c, m, y, k] => Some(Color::CMYK(c, m, y, k)),
            _ => None,
        }
    }

    /// Opaque RGBA bytes.
    pub fn rgba(&self) -> [u8; 4] {
        let byte = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        match *self {
            Color::Gray(g) => {
                let v = byte(g);
                [v, v, v, 255]
            }
            Color::RGB(r, g, b) => [byte(r), byte(g), byte(b), 255],
            Color::CMYK(c, m, y, k) => {
                let k = 1.0 - k.clamp(0.0, 1.0);
                [
                    byte((1.0 - c.clamp(0.0, 1.0)) * k),
                    byte((1.0 - m.clamp(0.0, 1.0)) * k),
                    byte((1.0 - y.clamp(0.0, 1.0)) * k),
                    255,
                ]
            }
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::black()
    }
}

/// What a fill or stroke paints with.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSource {
    Solid(Color),
    Pattern(Arc<PatternIR>),
}

impl ColorSource {
    pub fn solid_color(&self) -> Option<Color> {
        match self {
            ColorSource::Solid(color) => Some(*color),
            ColorSource::Pattern(_) => None,
        }
    }
}

impl Default for ColorSource {
    fn default() -> Self {
        ColorSource::Solid(Color::black())
    }
}

/// Text rendering mode (ISO 32000-1, 9.3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextRenderingMode {
    #[default]
    Fill = 0,
    Stroke = 1,
    FillStroke = 2,
    Invisible = 3,
    FillClip = 4,
    StrokeClip = 5,
    FillStrokeClip = 6,
    Clip = 7,
}

impl TextRenderingMode {
    pub fn from_u8(value: u8) -> Option<TextRenderingMode> {
        Some(match value {
            0 => TextRenderingMode::Fill,
            1 => TextRenderingMode::Stroke,
            2 => TextRenderingMode::FillStroke,
            3 => TextRenderingMode::Invisible,
            4 => TextRenderingMode::FillClip,
            5 => TextRenderingMode::StrokeClip,
            6 => TextRenderingMode::FillStrokeClip,
            7 => TextRenderingMode::Clip,
            _ => return None,
        })
    }

    pub fn fills(self) -> bool {
        matches!(
            self,
            TextRenderingMode::Fill
                | TextRenderingMode::FillStroke
                | TextRenderingMode::FillClip
                | TextRenderingMode::FillStrokeClip
        )
    }

    pub fn strokes(self) -> bool {
        matches!(
            self,
            TextRenderingMode::Stroke
                | TextRenderingMode::FillStroke
                | TextRenderingMode::StrokeClip
                | TextRenderingMode::FillStrokeClip
        )
    }

    /// Whether glyph outlines are added to the clip at `EndText`.
    pub fn adds_to_path(self) -> bool {
        (self as u8) & 4 != 0
    }
}

/// Fill rule for path filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillRule {
    /// Nonzero winding number rule (default for most operations)
    #[default]
    NonZero,
    EvenOdd,
}

/// Separable and non-separable blend modes (ISO 32000-1, 11.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Parses a `/BM` name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<BlendMode> {
        Some(match name {
            "Normal" | "Compatible" | "source-over" => BlendMode::Normal,
            "Multiply" => BlendMode::Multiply,
            "Screen" => BlendMode::Screen,
            "Overlay" => BlendMode::Overlay,
            "Darken" => BlendMode::Darken,
            "Lighten" => BlendMode::Lighten,
            "ColorDodge" => BlendMode::ColorDodge,
            "ColorBurn" => BlendMode::ColorBurn,
            "HardLight" => BlendMode::HardLight,
            "SoftLight" => BlendMode::SoftLight,
            "Difference" => BlendMode::Difference,
            "Exclusion" => BlendMode::Exclusion,
            "Hue" => BlendMode::Hue,
            "Saturation" => BlendMode::Saturation,
            "Color" => BlendMode::Color,
            "Luminosity" => BlendMode::Luminosity,
            _ => return None,
        })
    }
}

/// One entry of the interpreter's save/restore stack.
#[derive(Debug, Clone)]
pub struct GraphicsState {
    pub fill: ColorSource,
    pub stroke: ColorSource,
    pub fill_alpha: f64,
    pub stroke_alpha: f64,
    pub blend_mode: BlendMode,
    pub stroke_props: StrokeProps,

    pub font: Option<Arc<FontResource>>,
    pub font_size: f64,
    /// -1 when the font size operand was negative
    pub font_direction: f64,
    pub font_matrix: Matrix,
    pub text_rendering_mode: TextRenderingMode,
    /// Stored negated, as `NextLine` moves by `(0, leading)`
    pub leading: f64,
    pub char_spacing: f64,
    pub word_spacing: f64,
    /// Horizontal scaling as a fraction (1.0 = 100%)
    pub text_h_scale: f64,
    pub text_rise: f64,
    pub text_matrix: Matrix,
    pub text_matrix_scale: f64,
    pub x: f64,
    pub y: f64,
    pub line_x: f64,
    pub line_y: f64,

    /// Soft mask applied to everything drawn while it is set
    pub active_smask: Option<Arc<SoftMask>>,
}

impl Default for GraphicsState {
    fn default() -> Self {
        GraphicsState {
            fill: ColorSource::default(),
            stroke: ColorSource::default(),
            fill_alpha: 1.0,
            stroke_alpha: 1.0,
            blend_mode: BlendMode::Normal,
            stroke_props: StrokeProps::default(),
            font: None,
            font_size: 0.0,
            font_direction: 1.0,
            font_matrix: FONT_IDENTITY_MATRIX,
            text_rendering_mode: TextRenderingMode::default(),
            leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_h_scale: 1.0,
            text_rise: 0.0,
            text_matrix: IDENTITY,
            text_matrix_scale: 1.0,
            x: 0.0,
            y: 0.0,
            line_x: 0.0,
            line_y: 0.0,
            active_smask: None,
        }
    }
}

impl GraphicsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the text matrices at `BeginText`.
    pub fn begin_text(&mut self) {
        self.text_matrix = IDENTITY;
        self.text_matrix_scale = 1.0;
        self.x = 0.0;
        self.line_x = 0.0;
        self.y = 0.0;
        self.line_y = 0.0;
    }

    pub fn set_text_matrix(&mut self, matrix: Matrix) {
        self.text_matrix = matrix;
        self.text_matrix_scale = matrix[0].hypot(matrix[1]);
        self.x = 0.0;
        self.line_x = 0.0;
        self.y = 0.0;
        self.line_y = 0.0;
    }

    /// Starts a new line offset from the start of the current one.
    pub fn move_text(&mut self, x: f64, y: f64) {
        self.line_x += x;
        self.x = self.line_x;
        self.line_y += y;
        self.y = self.line_y;
    }

    pub fn next_line(&mut self) {
        self.move_text(0.0, self.leading);
    }

    /// Whether two states share the same soft mask instance.
    pub fn same_smask(&self, other: &GraphicsState) -> bool {
        match (&self.active_smask, &other.active_smask) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}
