//! Operator lists: positional opcode ids paired with argument tuples.
//!
//! Opcode ids are the stable wire numbering; the worker emits them in
//! chunks and the main side appends every chunk to one shared list.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::config::OPERATOR_LIST_CHUNK_SIZE;
use super::error::PDFResult;
use super::font::Glyph;
use super::image::{ImageMask, ImagePayload};
use super::stream_sink::StreamSink;
use super::transport::Payload;

/// Drawing operations, numbered as they travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// Object ids that must be resolved before continuing
    Dependency = 1,

    // Graphics State Operators
    /// w - Set line width
    SetLineWidth = 2,
    /// J - Set line cap style
    SetLineCap = 3,
    /// j - Set line join style
    SetLineJoin = 4,
    /// M - Set miter limit
    SetMiterLimit = 5,
    /// d - Set line dash pattern
    SetDash = 6,
    /// ri - Set rendering intent
    SetRenderingIntent = 7,
    /// i - Set flatness tolerance
    SetFlatness = 8,
    /// gs - Set graphics state from dictionary
    SetGState = 9,
    /// q - Save graphics state
    Save = 10,
    /// Q - Restore graphics state
    Restore = 11,
    /// cm - Concatenate matrix to current transformation matrix
    Transform = 12,

    // Path Construction Operators
    MoveTo = 13,
    LineTo = 14,
    CurveTo = 15,
    /// v - Append cubic Bézier curve (initial point replicated)
    CurveTo2 = 16,
    /// y - Append cubic Bézier curve (final point replicated)
    CurveTo3 = 17,
    ClosePath = 18,
    Rectangle = 19,

    // Path Painting Operators
    Stroke = 20,
    CloseStroke = 21,
    Fill = 22,
    EOFill = 23,
    FillStroke = 24,
    EOFillStroke = 25,
    CloseFillStroke = 26,
    CloseEOFillStroke = 27,
    /// n - End path without filling or stroking
    EndPath = 28,

    // Clipping Path Operators
    Clip = 29,
    EOClip = 30,

    // Text Object Operators
    BeginText = 31,
    EndText = 32,

    // Text State Operators
    SetCharSpacing = 33,
    SetWordSpacing = 34,
    /// Tz - Set horizontal scaling (percent)
    SetHScale = 35,
    SetLeading = 36,
    SetFont = 37,
    SetTextRenderingMode = 38,
    SetTextRise = 39,

    // Text Positioning Operators
    MoveText = 40,
    SetLeadingMoveText = 41,
    SetTextMatrix = 42,
    NextLine = 43,

    // Text Showing Operators
    ShowText = 44,
    ShowSpacedText = 45,
    NextLineShowText = 46,
    NextLineSetSpacingShowText = 47,

    // Type 3 Font Operators
    /// d0 - Set glyph width
    SetCharWidth = 48,
    /// d1 - Set glyph width and bounding box
    SetCharWidthAndBounds = 49,

    // Color Operators
    SetStrokeColorSpace = 50,
    SetFillColorSpace = 51,
    SetStrokeColor = 52,
    /// SCN - Set stroke color (supports Pattern)
    SetStrokeColorN = 53,
    SetFillColor = 54,
    /// scn - Set fill color (supports Pattern)
    SetFillColorN = 55,
    SetStrokeGray = 56,
    SetFillGray = 57,
    SetStrokeRGBColor = 58,
    SetFillRGBColor = 59,
    SetStrokeCMYKColor = 60,
    SetFillCMYKColor = 61,

    /// sh - Paint with shading pattern
    ShadingFill = 62,

    // Inline Image Operators
    BeginInlineImage = 63,
    BeginImageData = 64,
    EndInlineImage = 65,

    /// Do - Paint XObject
    PaintXObject = 66,

    // Marked Content Operators
    MarkPoint = 67,
    MarkPointProps = 68,
    BeginMarkedContent = 69,
    BeginMarkedContentProps = 70,
    EndMarkedContent = 71,

    // Compatibility Operators
    BeginCompat = 72,
    EndCompat = 73,

    // Operations produced by the evaluator rather than by a content-stream operator
    PaintFormXObjectBegin = 74,
    PaintFormXObjectEnd = 75,
    BeginGroup = 76,
    EndGroup = 77,
    BeginAnnotations = 78,
    EndAnnotations = 79,
    BeginAnnotation = 80,
    EndAnnotation = 81,
    PaintJpegXObject = 82,
    PaintImageMaskXObject = 83,
    PaintImageMaskXObjectGroup = 84,
    PaintImageXObject = 85,
    PaintInlineImageXObject = 86,
    PaintInlineImageXObjectGroup = 87,
    PaintImageXObjectRepeat = 88,
    PaintImageMaskXObjectRepeat = 89,
    PaintSolidColorImageMask = 90,
    /// Batched path construction: sub-op ids plus flattened coordinates
    ConstructPath = 91,
}

impl OpCode {
    const ALL: [OpCode; 91] = {
        use OpCode::*;
        [
            Dependency, SetLineWidth, SetLineCap, SetLineJoin, SetMiterLimit, SetDash,
            SetRenderingIntent, SetFlatness, SetGState, Save, Restore, Transform, MoveTo, LineTo,
            CurveTo, CurveTo2, CurveTo3, ClosePath, Rectangle, Stroke, CloseStroke, Fill, EOFill,
            FillStroke, EOFillStroke, CloseFillStroke, CloseEOFillStroke, EndPath, Clip, EOClip,
            BeginText, EndText, SetCharSpacing, SetWordSpacing, SetHScale, SetLeading, SetFont,
            SetTextRenderingMode, SetTextRise, MoveText, SetLeadingMoveText, SetTextMatrix,
            NextLine, ShowText, ShowSpacedText, NextLineShowText, NextLineSetSpacingShowText,
            SetCharWidth, SetCharWidthAndBounds, SetStrokeColorSpace, SetFillColorSpace,
            SetStrokeColor, SetStrokeColorN, SetFillColor, SetFillColorN, SetStrokeGray,
            SetFillGray, SetStrokeRGBColor, SetFillRGBColor, SetStrokeCMYKColor,
            SetFillCMYKColor, ShadingFill, BeginInlineImage, BeginImageData, EndInlineImage,
            PaintXObject, MarkPoint, MarkPointProps, BeginMarkedContent, BeginMarkedContentProps,
            EndMarkedContent, BeginCompat, EndCompat, PaintFormXObjectBegin, PaintFormXObjectEnd,
            BeginGroup, EndGroup, BeginAnnotations, EndAnnotations, BeginAnnotation,
            EndAnnotation, PaintJpegXObject, PaintImageMaskXObject, PaintImageMaskXObjectGroup,
            PaintImageXObject, PaintInlineImageXObject, PaintInlineImageXObjectGroup,
            PaintImageXObjectRepeat, PaintImageMaskXObjectRepeat, PaintSolidColorImageMask,
            ConstructPath,
        ]
    };

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Maps a wire id back to an opcode; `None` for ids this build does not know.
    pub fn from_id(id: u8) -> Option<OpCode> {
        let index = usize::from(id).checked_sub(1)?;
        OpCode::ALL.get(index).copied()
    }
}

/// One positional argument of an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpArg {
    Null,
    Bool(bool),
    Number(f64),
    Name(String),
    Bytes(Vec<u8>),
    Numbers(Vec<f64>),
    /// Sub-op ids of `ConstructPath`
    PathOps(Vec<u8>),
    Glyphs(Vec<GlyphItem>),
    GState(Vec<GStateEntry>),
    Group(Box<GroupOptions>),
    Pattern(Box<PatternIR>),
    Shading(Box<ShadingIR>),
    Image(Box<ImagePayload>),
    ImageMask(Box<ImageMask>),
    ImageMaskGroup(Vec<MaskPlacement>),
    InlineImagePlacements(Vec<InlineImagePlacement>),
    /// Marked-content properties and other opaque dictionaries
    Dict(serde_json::Value),
}

impl OpArg {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OpArg::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            OpArg::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            OpArg::Numbers(values) => Some(values),
            _ => None,
        }
    }
}

pub type OpArgs = SmallVec<[OpArg; 4]>;

/// Builds an argument tuple of plain numbers.
pub fn numbers(values: &[f64]) -> OpArgs {
    values.iter().map(|value| OpArg::Number(*value)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlyphItem {
    Glyph(Glyph),
    /// TJ adjustment in thousandths of text space
    Spacing(f64),
}

/// One entry of an ExtGState dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GStateEntry {
    LineWidth(f64),
    LineCap(u8),
    LineJoin(u8),
    MiterLimit(f64),
    Dash(Vec<f64>, f64),
    RenderingIntent(String),
    Flatness(f64),
    Font(String, f64),
    StrokeAlpha(f64),
    FillAlpha(f64),
    BlendMode(String),
    /// `true` activates the soft mask of the last finished mask group.
    SMask(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SMaskSubtype {
    Alpha,
    Luminosity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SMaskOptions {
    pub subtype: SMaskSubtype,
    pub backdrop: Option<[u8; 3]>,
    /// 256-entry transfer function
    pub transfer_map: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    pub matrix: Option<[f64; 6]>,
    pub bbox: [f64; 4],
    pub smask: Option<SMaskOptions>,
    pub isolated: bool,
    pub knockout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatternIR {
    Tiling(TilingPatternIR),
    Shading(ShadingIR),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingPatternIR {
    pub operator_list: OperatorList,
    pub matrix: [f64; 6],
    pub bbox: [f64; 4],
    pub x_step: f64,
    pub y_step: f64,
    /// 1 = colored, 2 = uncolored
    pub paint_type: u8,
    /// Color for uncolored patterns
    pub color: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ShadingKind {
    Axial { coords: [f64; 4] },
    Radial { coords: [f64; 6] },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadingIR {
    pub kind: ShadingKind,
    /// (offset in 0..=1, rgb)
    pub stops: Vec<(f32, [u8; 3])>,
    pub matrix: Option<[f64; 6]>,
    pub bbox: Option<[f64; 4]>,
    pub background: Option<[u8; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskPlacement {
    pub mask: ImageMask,
    pub transform: [f64; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineImagePlacement {
    pub transform: [f64; 6],
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// The accumulated drawing instructions of one page intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorList {
    pub fn_array: Vec<u8>,
    pub args_array: Vec<OpArgs>,
    pub last_chunk: bool,
}

impl OperatorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fn_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fn_array.is_empty()
    }

    pub fn add_op(&mut self, op: OpCode, args: OpArgs) {
        self.fn_array.push(op.id());
        self.args_array.push(args);
    }

    pub fn add_dependency(&mut self, id: &str) {
        let mut args = OpArgs::new();
        args.push(OpArg::Name(id.to_string()));
        self.add_op(OpCode::Dependency, args);
    }

    /// Appends a received chunk. The list only grows.
    pub fn append_chunk(&mut self, chunk: OperatorListChunk) {
        debug_assert_eq!(chunk.fn_array.len(), chunk.args_array.len());
        let count = chunk.fn_array.len().min(chunk.args_array.len());
        self.fn_array.extend(chunk.fn_array.into_iter().take(count));
        self.args_array.extend(chunk.args_array.into_iter().take(count));
        self.last_chunk = chunk.last_chunk;
    }

    pub fn op_at(&self, index: usize) -> Option<OpCode> {
        self.fn_array.get(index).copied().and_then(OpCode::from_id)
    }
}

/// One transmitted slice of an operator list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorListChunk {
    pub fn_array: Vec<u8>,
    pub args_array: Vec<OpArgs>,
    pub last_chunk: bool,
    /// Total operators sent so far, including this chunk
    pub length: usize,
}

/// Worker-side builder that streams an operator list in fixed-size chunks.
pub struct OperatorListWriter {
    pending: OperatorList,
    dependencies: FxHashSet<String>,
    total_length: usize,
    chunk_size: usize,
    sink: StreamSink,
}

impl OperatorListWriter {
    pub fn new(sink: StreamSink) -> Self {
        Self::with_chunk_size(sink, OPERATOR_LIST_CHUNK_SIZE)
    }

    pub fn with_chunk_size(sink: StreamSink, chunk_size: usize) -> Self {
        OperatorListWriter {
            pending: OperatorList::new(),
            dependencies: FxHashSet::default(),
            total_length: 0,
            chunk_size: chunk_size.max(1),
            sink,
        }
    }

    pub fn add_op(&mut self, op: OpCode, args: OpArgs) {
        self.pending.add_op(op, args);
        if self.pending.len() >= self.chunk_size {
            self.flush(false);
        }
    }

    /// Adds a `Dependency` op unless this chunk already declared `id`.
    pub fn add_dependency(&mut self, id: &str) {
        if self.dependencies.insert(id.to_string()) {
            self.pending.add_dependency(id);
        }
    }

    pub fn total_length(&self) -> usize {
        self.total_length + self.pending.len()
    }

    pub fn flush(&mut self, last_chunk: bool) {
        let pending = std::mem::take(&mut self.pending);
        self.total_length += pending.len();
        self.dependencies.clear();
        let chunk = OperatorListChunk {
            fn_array: pending.fn_array,
            args_array: pending.args_array,
            last_chunk,
            length: self.total_length,
        };
        self.sink.enqueue(Payload::OperatorList(chunk), 1);
    }

    /// Waits for consumer capacity.
    pub async fn ready(&self) -> PDFResult<()> {
        self.sink.ready().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }
}
