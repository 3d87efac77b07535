//! Font resources shipped from the worker.
//!
//! The worker translates font programs; the main side only checks that the
//! program is in a format the host can load and otherwise falls back to a
//! host font family. Glyph outlines arrive separately as `FontPath` objects,
//! and Type 3 glyphs carry their own operator lists.

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::error::{PDFError, PDFResult};
use super::operator_list::OperatorList;

/// Glyph space to text space for fonts with 1000 units per em.
pub const FONT_IDENTITY_MATRIX: [f64; 6] = [0.001, 0.0, 0.0, 0.001, 0.0, 0.0];

/// One step of a glyph outline, in glyph space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PathCommand {
    MoveTo(f64, f64),
    LineTo(f64, f64),
    CurveTo(f64, f64, f64, f64, f64, f64),
    QuadraticCurveTo(f64, f64, f64, f64),
    ClosePath,
}

/// A shaped glyph as produced by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Glyph {
    /// Character in the translated font program
    pub font_char: String,
    pub unicode: String,
    /// Advance in glyph units
    pub width: f64,
    /// Vertical metrics `[w1y, vx, vy]` for vertical fonts
    pub vmetric: Option<[f64; 3]>,
    /// Type 3 glyph program id
    pub operator_list_id: Option<String>,
    pub is_space: bool,
    pub is_in_font: bool,
}

/// Translated font as sent by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontData {
    pub loaded_name: String,
    pub name: String,
    pub fallback_name: String,
    /// Translated font program
    pub data: Option<Bytes>,
    pub mimetype: Option<String>,
    pub missing_file: bool,
    pub is_type3: bool,
    pub vertical: bool,
    pub bold: bool,
    pub italic: bool,
    pub font_matrix: Option<[f64; 6]>,
    pub bbox: Option<[f64; 4]>,
    pub ascent: f64,
    pub descent: f64,
    /// Type 3 glyph programs keyed by `Glyph::operator_list_id`
    pub char_procs: FxHashMap<String, OperatorList>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFormat {
    TrueType,
    OpenType,
    Type1,
    Cff,
}

/// Identifies a font program by its header bytes.
pub fn sniff_font_format(data: &[u8]) -> Option<FontFormat> {
    match data {
        [0x00, 0x01, 0x00, 0x00, ..] | [b't', b'r', b'u', b'e', ..] => Some(FontFormat::TrueType),
        [b'O', b'T', b'T', b'O', ..] => Some(FontFormat::OpenType),
        [b'%', b'!', ..] | [0x80, 0x01, ..] => Some(FontFormat::Type1),
        [0x01, 0x00, 0x04, ..] => Some(FontFormat::Cff),
        _ => None,
    }
}

/// A font entry of the common object pool.
#[derive(Debug, Clone, PartialEq)]
pub struct FontResource {
    pub data: FontData,
    pub format: Option<FontFormat>,
    /// Set when the program could not be loaded; text is drawn with
    /// `fallback_name` instead.
    pub fallback: bool,
}

impl FontResource {
    /// Validates the font program. Fonts without a program (Type 3, or
    /// standard fonts not embedded) need none.
    pub fn load(data: FontData) -> PDFResult<FontResource> {
        let format = match &data.data {
            Some(program) if !data.is_type3 => Some(sniff_font_format(program).ok_or_else(|| {
                PDFError::Generic(format!(
                    "Font \"{}\" has an unrecognized program format",
                    data.loaded_name
                ))
            })?),
            _ => None,
        };
        Ok(FontResource {
            data,
            format,
            fallback: false,
        })
    }

    pub fn fallback(mut data: FontData) -> FontResource {
        if data.fallback_name.is_empty() {
            data.fallback_name = "sans-serif".to_string();
        }
        data.data = None;
        FontResource {
            data,
            format: None,
            fallback: true,
        }
    }

    /// Fallback resource for a font the worker could not translate at all.
    pub fn from_error(loaded_name: &str) -> FontResource {
        FontResource::fallback(FontData {
            loaded_name: loaded_name.to_string(),
            ..Default::default()
        })
    }

    pub fn loaded_name(&self) -> &str {
        &self.data.loaded_name
    }

    pub fn is_type3(&self) -> bool {
        self.data.is_type3
    }

    pub fn font_matrix(&self) -> [f64; 6] {
        self.data.font_matrix.unwrap_or(FONT_IDENTITY_MATRIX)
    }

    /// Family the host should use for `fill_text`.
    pub fn family(&self) -> &str {
        if self.fallback || self.data.missing_file {
            &self.data.fallback_name
        } else {
            &self.data.loaded_name
        }
    }

    /// Whether glyphs can be drawn from `FontPath` outlines.
    pub fn has_outlines(&self) -> bool {
        !self.fallback && self.format.is_some()
    }

    /// Common-object id of a glyph outline.
    pub fn glyph_path_id(&self, glyph: &Glyph) -> String {
        format!("{}_path_{}", self.data.loaded_name, glyph.font_char)
    }

    pub fn char_proc(&self, glyph: &Glyph) -> Option<&OperatorList> {
        let id = glyph.operator_list_id.as_ref()?;
        self.data.char_procs.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_formats() {
        assert_eq!(sniff_font_format(&[0, 1, 0, 0, 0]), Some(FontFormat::TrueType));
        assert_eq!(sniff_font_format(b"OTTO...."), Some(FontFormat::OpenType));
        assert_eq!(sniff_font_format(b"%!PS-AdobeFont"), Some(FontFormat::Type1));
        assert_eq!(sniff_font_format(&[1, 0, 4, 2]), Some(FontFormat::Cff));
        assert_eq!(sniff_font_format(b"garbage"), None);
        assert_eq!(sniff_font_format(&[]), None);
    }

    #[test]
    fn test_unrecognized_program_fails_to_load() {
        let data = FontData {
            loaded_name: "g_d0_f1".into(),
            data: Some(Bytes::from_static(b"not a font")),
            ..Default::default()
        };
        assert!(FontResource::load(data.clone()).is_err());

        let fallback = FontResource::fallback(data);
        assert!(fallback.fallback);
        assert_eq!(fallback.family(), "sans-serif");
        assert!(!fallback.has_outlines());
    }

    #[test]
    fn test_type3_font_needs_no_program() {
        let mut char_procs = FxHashMap::default();
        char_procs.insert("a".to_string(), OperatorList::new());
        let font = FontResource::load(FontData {
            loaded_name: "g_d0_f2".into(),
            is_type3: true,
            font_matrix: Some([0.01, 0.0, 0.0, 0.01, 0.0, 0.0]),
            char_procs,
            ..Default::default()
        })
        .unwrap();

        let glyph = Glyph {
            font_char: "a".into(),
            operator_list_id: Some("a".into()),
            ..Default::default()
        };
        assert!(font.char_proc(&glyph).is_some());
        assert_eq!(font.font_matrix()[0], 0.01);
        assert_eq!(font.glyph_path_id(&glyph), "g_d0_f2_path_a");
    }
}
