//! Shared fixtures for the session tests.
//!
//! `StripeDocument` stands in for a parsed document: every page fills the
//! viewport with one solid color, emitting enough operators to span several
//! stream chunks.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use pdf_x_display::core::operator_list::{OpArgs, OpCode, numbers};
use pdf_x_display::core::text_content::{TextContentParams, TextContentWriter, TextItem};
use pdf_x_display::core::transport::ObjectData;
use pdf_x_display::core::worker::OpenRequest;
use pdf_x_display::core::*;

/// Fill colors by page index, 0..1 components.
pub const PAGE_COLORS: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

pub const PAGE_SIZE: f64 = 20.0;

pub struct StripeDocument {
    pub pages: usize,
    /// Redundant save/restore pairs emitted before the fill
    pub padding_ops: usize,
    /// Page 1 depends on a page image and page 2 on a common image, both
    /// shipped as bytes that are not a JPEG
    pub corrupt_images: bool,
}

/// Bytes the main side cannot decode as a JPEG.
pub const CORRUPT_JPEG: &[u8] = b"\x00\x01 not a jpeg";

impl PdfDocument for StripeDocument {
    fn num_pages(&self) -> usize {
        self.pages
    }

    fn fingerprints(&self) -> Vec<Option<String>> {
        vec![Some("5f2c0e".into()), None]
    }

    fn page_info(&self, _page_index: usize) -> PDFResult<PageInfo> {
        Ok(PageInfo {
            view: [0.0, 0.0, PAGE_SIZE, PAGE_SIZE],
            ..Default::default()
        })
    }

    fn has_transparency(&self, _page_index: usize) -> bool {
        false
    }

    fn operator_list<'a>(
        &'a self,
        page_index: usize,
        evaluation: &'a mut PageEvaluation,
    ) -> BoxFuture<'a, PDFResult<()>> {
        Box::pin(async move {
            if self.corrupt_images {
                let corrupt = ObjectData::JpegStream(Bytes::from_static(CORRUPT_JPEG));
                match page_index {
                    0 => {
                        evaluation.send_page_object("img_p0_1", corrupt)?;
                        evaluation.add_dependency("img_p0_1");
                    }
                    1 => {
                        evaluation.send_common_object("g_d0_img_1", corrupt)?;
                        evaluation.add_dependency("g_d0_img_1");
                    }
                    _ => {}
                }
            }
            for _ in 0..self.padding_ops {
                evaluation.add_op(OpCode::Save, OpArgs::new());
                evaluation.add_op(OpCode::Restore, OpArgs::new());
                if evaluation.is_cancelled() {
                    return Ok(());
                }
            }
            evaluation.add_op(
                OpCode::SetFillRGBColor,
                numbers(&PAGE_COLORS[page_index % PAGE_COLORS.len()]),
            );
            evaluation.add_op(OpCode::Rectangle, numbers(&[0.0, 0.0, PAGE_SIZE, PAGE_SIZE]));
            evaluation.add_op(OpCode::Fill, OpArgs::new());
            evaluation.ready().await
        })
    }

    fn text_content<'a>(
        &'a self,
        page_index: usize,
        _params: TextContentParams,
        writer: &'a mut TextContentWriter,
    ) -> BoxFuture<'a, PDFResult<()>> {
        Box::pin(async move {
            writer.push(TextItem {
                str: format!("Page {}", page_index + 1),
                ..Default::default()
            });
            Ok(())
        })
    }
}

/// Opens a [`StripeDocument`] and remembers the bytes it was handed.
pub struct StripeProvider {
    pub pages: usize,
    pub padding_ops: usize,
    pub corrupt_images: bool,
    pub received: Mutex<Option<Bytes>>,
}

impl StripeProvider {
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(StripeProvider {
            pages,
            padding_ops: 0,
            corrupt_images: false,
            received: Mutex::new(None),
        })
    }

    pub fn with_corrupt_images(pages: usize) -> Arc<Self> {
        Arc::new(StripeProvider {
            pages,
            padding_ops: 0,
            corrupt_images: true,
            received: Mutex::new(None),
        })
    }

    pub fn with_padding(pages: usize, padding_ops: usize) -> Arc<Self> {
        Arc::new(StripeProvider {
            pages,
            padding_ops,
            corrupt_images: false,
            received: Mutex::new(None),
        })
    }

    pub fn received(&self) -> Option<Bytes> {
        self.received.lock().unwrap().clone()
    }
}

impl DocumentProvider for StripeProvider {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, PDFResult<Arc<dyn PdfDocument>>> {
        Box::pin(async move {
            *self.received.lock().unwrap() = Some(request.data);
            Ok(Arc::new(StripeDocument {
                pages: self.pages,
                padding_ops: self.padding_ops,
                corrupt_images: self.corrupt_images,
            }) as Arc<dyn PdfDocument>)
        })
    }
}

/// Deterministic document bytes.
pub fn sample_bytes(length: usize) -> Bytes {
    (0..length).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// A host transport serving `data`, with `initial` bytes pushed up front.
/// Every requested range is recorded and answered immediately.
pub fn serving_transport(
    data: Bytes,
    initial: usize,
) -> (Arc<PDFDataRangeTransport>, Arc<Mutex<Vec<(u64, u64)>>>) {
    let transport = Arc::new(PDFDataRangeTransport::new(
        data.len() as u64,
        Some(data.slice(..initial)),
    ));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&transport);
    let seen = Arc::clone(&requests);
    transport.set_range_requester(move |begin, end| {
        seen.lock().unwrap().push((begin, end));
        if let Some(transport) = weak.upgrade() {
            let end = (end as usize).min(data.len());
            transport.on_data_range(begin, data.slice(begin as usize..end));
        }
    });
    (transport, requests)
}

pub fn expected_pixel(page_index: usize) -> [u8; 4] {
    let [r, g, b] = PAGE_COLORS[page_index % PAGE_COLORS.len()];
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8, 255]
}
