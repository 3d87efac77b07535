//! Text content items streamed from the worker.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::config::TEXT_CONTENT_CHUNK_SIZE;
use super::error::PDFResult;
use super::stream_sink::StreamSink;
use super::transport::Payload;

/// A run of text with its placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub str: String,
    /// "ltr", "rtl" or "ttb"
    pub dir: String,
    pub width: f64,
    pub height: f64,
    pub transform: [f64; 6],
    pub font_name: String,
    pub has_eol: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    pub font_family: String,
    pub ascent: f64,
    pub descent: f64,
    pub vertical: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub items: Vec<TextItem>,
    pub styles: FxHashMap<String, TextStyle>,
    pub lang: Option<String>,
}

impl TextContent {
    /// Merges a streamed chunk into the accumulated content.
    pub fn append(&mut self, chunk: TextContent) {
        self.items.extend(chunk.items);
        self.styles.extend(chunk.styles);
        if chunk.lang.is_some() {
            self.lang = chunk.lang;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextContentParams {
    pub include_marked_content: bool,
    pub disable_normalization: bool,
}

/// Worker-side batching of text items into stream chunks. Each chunk's
/// size is its item count.
pub struct TextContentWriter {
    pending: TextContent,
    sink: StreamSink,
}

impl TextContentWriter {
    pub fn new(sink: StreamSink) -> Self {
        TextContentWriter {
            pending: TextContent::default(),
            sink,
        }
    }

    pub fn add_style(&mut self, font_name: &str, style: TextStyle) {
        self.pending.styles.insert(font_name.to_string(), style);
    }

    pub fn set_lang(&mut self, lang: &str) {
        self.pending.lang = Some(lang.to_string());
    }

    pub fn push(&mut self, item: TextItem) {
        self.pending.items.push(item);
        if self.pending.items.len() >= TEXT_CONTENT_CHUNK_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.pending.items.is_empty() && self.pending.styles.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut self.pending);
        let size = chunk.items.len() as i64;
        self.sink.enqueue(Payload::TextContent(chunk), size);
    }

    pub async fn ready(&self) -> PDFResult<()> {
        self.sink.ready().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(text: &str) -> TextItem {
        TextItem {
            str: text.to_string(),
            dir: "ltr".to_string(),
            transform: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            font_name: "g_d0_f1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_append_merges_items_and_styles() {
        let mut content = TextContent::default();
        let mut first = TextContent {
            items: vec![item("Hello")],
            ..Default::default()
        };
        first.styles.insert("g_d0_f1".into(), TextStyle::default());
        content.append(first);
        content.append(TextContent {
            items: vec![item("world")],
            lang: Some("en".into()),
            ..Default::default()
        });

        let texts: Vec<&str> = content.items.iter().map(|i| i.str.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "world"]);
        assert_eq!(content.styles.len(), 1);
        assert_eq!(content.lang.as_deref(), Some("en"));
    }
}
