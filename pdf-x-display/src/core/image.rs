//! Image payloads and their decoding into RGBA bitmaps.
//!
//! The worker ships images either already decoded (`ImagePayload`) or as
//! raw JPEG streams, which are decoded here with zune-jpeg.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{PDFError, PDFResult};

/// Pixel layout of an [`ImagePayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// Packed 1 bit per pixel, rows padded to a byte; set bits are white
    Grayscale1Bpp = 1,
    Rgb24Bpp = 2,
    Rgba32Bpp = 3,
}

impl ImageKind {
    fn row_bytes(self, width: usize) -> usize {
        match self {
            ImageKind::Grayscale1Bpp => width.div_ceil(8),
            ImageKind::Rgb24Bpp => width * 3,
            ImageKind::Rgba32Bpp => width * 4,
        }
    }
}

/// Decoded image data as sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub width: u32,
    pub height: u32,
    pub kind: ImageKind,
    pub data: Bytes,
}

impl ImagePayload {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Expands the payload to straight RGBA.
    pub fn to_bitmap(&self) -> PDFResult<ImageBitmap> {
        let width = self.width as usize;
        let height = self.height as usize;
        let row_bytes = self.kind.row_bytes(width);
        if self.data.len() < row_bytes * height {
            return Err(PDFError::Generic(format!(
                "Insufficient image data: expected at least {} bytes, got {}",
                row_bytes * height,
                self.data.len()
            )));
        }

        let mut rgba = Vec::with_capacity(width * height * 4);
        match self.kind {
            ImageKind::Grayscale1Bpp => {
                for row in self.data.chunks(row_bytes).take(height) {
                    for x in 0..width {
                        let bit = row[x / 8] & (0x80 >> (x % 8));
                        let value = if bit != 0 { 0xFF } else { 0x00 };
                        rgba.extend_from_slice(&[value, value, value, 0xFF]);
                    }
                }
            }
            ImageKind::Rgb24Bpp => {
                for pixel in self.data[..row_bytes * height].chunks_exact(3) {
                    rgba.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 0xFF]);
                }
            }
            ImageKind::Rgba32Bpp => rgba.extend_from_slice(&self.data[..row_bytes * height]),
        }

        Ok(ImageBitmap {
            width: self.width,
            height: self.height,
            data: Bytes::from(rgba),
        })
    }
}

/// Straight (non-premultiplied) RGBA pixels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBitmap {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl ImageBitmap {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A stencil mask: 1 bit per pixel, rows padded to a byte. Set bits are
/// transparent, clear bits take the fill color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMask {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl ImageMask {
    /// Paints the mask with `color`.
    pub fn to_bitmap(&self, color: [u8; 4]) -> PDFResult<ImageBitmap> {
        let width = self.width as usize;
        let height = self.height as usize;
        let row_bytes = width.div_ceil(8);
        if self.data.len() < row_bytes * height {
            return Err(PDFError::Generic(format!(
                "Insufficient mask data: expected at least {} bytes, got {}",
                row_bytes * height,
                self.data.len()
            )));
        }

        let mut rgba = vec![0u8; width * height * 4];
        for (y, row) in self.data.chunks(row_bytes).take(height).enumerate() {
            for x in 0..width {
                if row[x / 8] & (0x80 >> (x % 8)) == 0 {
                    let offset = (y * width + x) * 4;
                    rgba[offset..offset + 4].copy_from_slice(&color);
                }
            }
        }

        Ok(ImageBitmap {
            width: self.width,
            height: self.height,
            data: Bytes::from(rgba),
        })
    }
}

/// Decodes a DCT stream into RGBA.
pub fn decode_jpeg(data: &[u8]) -> PDFResult<ImageBitmap> {
    #[cfg(feature = "jpeg-decoding")]
    {
        use std::io::Cursor;
        use zune_jpeg::zune_core::options::DecoderOptions;

        let options = DecoderOptions::default()
            .set_max_width(u16::MAX as usize)
            .set_max_height(u16::MAX as usize);
        let mut decoder = zune_jpeg::JpegDecoder::new_with_options(Cursor::new(data), options);

        decoder
            .decode_headers()
            .map_err(|e| PDFError::Generic(format!("JPEG header decode error: {:?}", e)))?;
        let info = decoder
            .info()
            .ok_or_else(|| PDFError::Generic("Failed to get JPEG info".to_string()))?;
        let width = info.width as usize;
        let height = info.height as usize;

        let decoded = decoder
            .decode()
            .map_err(|e| PDFError::Generic(format!("JPEG decode error: {:?}", e)))?;
        let pixels = width * height;
        if pixels == 0 {
            return Err(PDFError::Generic("JPEG image is empty".to_string()));
        }

        let channels = decoded.len() / pixels;
        let mut rgba = Vec::with_capacity(pixels * 4);
        match channels {
            1 => {
                for &gray in &decoded[..pixels] {
                    rgba.extend_from_slice(&[gray, gray, gray, 0xFF]);
                }
            }
            3 => {
                for pixel in decoded[..pixels * 3].chunks_exact(3) {
                    rgba.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 0xFF]);
                }
            }
            4 => rgba.extend_from_slice(&decoded[..pixels * 4]),
            other => {
                return Err(PDFError::Generic(format!(
                    "Unsupported JPEG channel count: {}",
                    other
                )));
            }
        }

        Ok(ImageBitmap {
            width: width as u32,
            height: height as u32,
            data: Bytes::from(rgba),
        })
    }

    #[cfg(not(feature = "jpeg-decoding"))]
    {
        let _ = data;
        Err(PDFError::Generic(
            "JPEG decoding not enabled. Enable the 'jpeg-decoding' feature.".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_expands_to_opaque_rgba() {
        let payload = ImagePayload {
            width: 2,
            height: 1,
            kind: ImageKind::Rgb24Bpp,
            data: Bytes::from_static(&[255, 0, 0, 0, 0, 255]),
        };
        let bitmap = payload.to_bitmap().unwrap();
        assert_eq!(&bitmap.data[..], &[255, 0, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn test_one_bit_rows_are_byte_padded() {
        // 3 pixels wide: 0b101_00000 per row.
        let payload = ImagePayload {
            width: 3,
            height: 2,
            kind: ImageKind::Grayscale1Bpp,
            data: Bytes::from_static(&[0b1010_0000, 0b0100_0000]),
        };
        let bitmap = payload.to_bitmap().unwrap();
        let reds: Vec<u8> = bitmap.data.chunks(4).map(|p| p[0]).collect();
        assert_eq!(reds, vec![255, 0, 255, 0, 255, 0]);
    }

    #[test]
    fn test_short_data_is_rejected() {
        let payload = ImagePayload {
            width: 4,
            height: 4,
            kind: ImageKind::Rgba32Bpp,
            data: Bytes::from_static(&[0; 8]),
        };
        assert!(payload.to_bitmap().is_err());
    }

    #[test]
    fn test_mask_set_bits_are_transparent() {
        let mask = ImageMask {
            width: 2,
            height: 1,
            data: Bytes::from_static(&[0b1000_0000]),
        };
        let bitmap = mask.to_bitmap([10, 20, 30, 255]).unwrap();
        assert_eq!(&bitmap.data[..], &[0, 0, 0, 0, 10, 20, 30, 255]);
    }

    #[test]
    fn test_garbage_jpeg_fails() {
        assert!(decode_jpeg(b"definitely not a jpeg").is_err());
    }
}
