//! Soft-mask composition.
//!
//! A soft mask is rendered into its own surface first. Content drawn while
//! the mask is active goes to a separate layer whose alpha is then scaled by
//! the mask, either by the mask's alpha or by its luminosity, before the
//! layer is drawn onto the parent surface.

use crate::core::image::ImageBitmap;
use crate::core::operator_list::SMaskSubtype;

/// Largest side of an off-surface group; bigger groups are drawn scaled down.
pub const MAX_GROUP_SIZE: u32 = 4096;

/// Pixels composed per pass.
const PIXELS_TO_PROCESS: usize = 1_048_576;

/// A finished mask group, ready to be activated by `SMask` in a gstate.
#[derive(Debug, Clone)]
pub struct SoftMask {
    /// The rendered mask group, in its own pixel space
    pub mask: ImageBitmap,
    /// Device position of the mask's top-left pixel
    pub offset_x: f64,
    pub offset_y: f64,
    /// Device pixels per mask pixel
    pub scale_x: f64,
    pub scale_y: f64,
    pub subtype: SMaskSubtype,
    pub backdrop: Option<[u8; 3]>,
    pub transfer_map: Option<Vec<u8>>,
}

impl SoftMask {
    /// Mask pixel space to device space.
    pub fn placement(&self) -> [f64; 6] {
        [self.scale_x, 0.0, 0.0, self.scale_y, self.offset_x, self.offset_y]
    }

    fn transfer_map(&self) -> Option<&[u8]> {
        self.transfer_map.as_deref().filter(|map| map.len() >= 256)
    }

    /// Applies this mask to `layer`, which must have the mask's dimensions.
    pub fn apply(&self, layer: &mut ImageBitmap) {
        let mut data = layer.data.to_vec();
        compose_smask(
            &self.mask.data,
            &mut data,
            self.mask.width as usize,
            self.mask.height as usize,
            self.subtype,
            self.backdrop,
            self.transfer_map(),
        );
        layer.data = data.into();
    }
}

/// Paints `backdrop` under transparent and partially transparent mask pixels.
pub fn compose_backdrop(mask: &mut [u8], backdrop: [u8; 3]) {
    let [r0, g0, b0] = backdrop.map(u32::from);
    for pixel in mask.chunks_exact_mut(4) {
        let alpha = u32::from(pixel[3]);
        if alpha == 0 {
            pixel[0] = r0 as u8;
            pixel[1] = g0 as u8;
            pixel[2] = b0 as u8;
        } else if alpha < 255 {
            let alpha_ = 255 - alpha;
            pixel[0] = ((u32::from(pixel[0]) * alpha + r0 * alpha_) >> 8) as u8;
            pixel[1] = ((u32::from(pixel[1]) * alpha + g0 * alpha_) >> 8) as u8;
            pixel[2] = ((u32::from(pixel[2]) * alpha + b0 * alpha_) >> 8) as u8;
        }
    }
}

/// Scales layer alpha by mask alpha.
pub fn compose_alpha(mask: &[u8], layer: &mut [u8], transfer_map: Option<&[u8]>) {
    for (mask_px, layer_px) in mask.chunks_exact(4).zip(layer.chunks_exact_mut(4)) {
        let alpha = match transfer_map {
            Some(map) => u32::from(map[usize::from(mask_px[3])]),
            None => u32::from(mask_px[3]),
        };
        layer_px[3] = (u32::from(layer_px[3]) * alpha / 255) as u8;
    }
}

/// Scales layer alpha by mask luminance, `77R + 152G + 28B` out of 65535.
pub fn compose_luminosity(mask: &[u8], layer: &mut [u8], transfer_map: Option<&[u8]>) {
    for (mask_px, layer_px) in mask.chunks_exact(4).zip(layer.chunks_exact_mut(4)) {
        let y = u32::from(mask_px[0]) * 77 + u32::from(mask_px[1]) * 152 + u32::from(mask_px[2]) * 28;
        let alpha = u32::from(layer_px[3]);
        layer_px[3] = match transfer_map {
            Some(map) => (alpha * u32::from(map[(y >> 8) as usize]) + 127) / 255,
            None => (alpha * y + 32767) / 65535,
        } as u8;
    }
}

/// Composes `layer` with `mask` in place, a band of rows at a time.
pub fn compose_smask(
    mask: &[u8],
    layer: &mut [u8],
    width: usize,
    height: usize,
    subtype: SMaskSubtype,
    backdrop: Option<[u8; 3]>,
    transfer_map: Option<&[u8]>,
) {
    if width == 0 || height == 0 {
        return;
    }
    let row_bytes = width * 4;
    let rows = height
        .min(mask.len() / row_bytes)
        .min(layer.len() / row_bytes);
    let chunk_rows = height.min(PIXELS_TO_PROCESS.div_ceil(width)).max(1);

    let mut row = 0;
    while row < rows {
        let chunk_height = chunk_rows.min(rows - row);
        let range = row * row_bytes..(row + chunk_height) * row_bytes;
        let mut mask_chunk = mask[range.clone()].to_vec();
        if let Some(backdrop) = backdrop {
            compose_backdrop(&mut mask_chunk, backdrop);
        }
        let layer_chunk = &mut layer[range];
        match subtype {
            SMaskSubtype::Luminosity => compose_luminosity(&mask_chunk, layer_chunk, transfer_map),
            SMaskSubtype::Alpha => compose_alpha(&mask_chunk, layer_chunk, transfer_map),
        }
        row += chunk_height;
    }
}
