//! Pool of off-screen surfaces reused across groups, masks and patterns.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::core::error::PDFResult;
use crate::rendering::device::Device;

/// Upper bound on surfaces kept alive between uses.
const MAX_CACHED_SURFACES: usize = 32;

/// What an off-screen surface is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfacePurpose {
    /// Page layer used when the output keeps transparency
    Transparent,
    Group { level: usize },
    SoftMask { level: usize, slot: usize },
    SMaskGroup { level: usize },
    TilingPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceKey {
    pub purpose: SurfacePurpose,
    /// Nesting depth of the rendering context that owns the surface
    pub generation: usize,
}

impl SurfaceKey {
    pub fn new(purpose: SurfacePurpose, generation: usize) -> Self {
        SurfaceKey {
            purpose,
            generation,
        }
    }
}

/// Surfaces are moved out with [`CachedSurfaces::take`] while in use and
/// handed back with [`CachedSurfaces::put`].
pub struct CachedSurfaces {
    cache: LruCache<SurfaceKey, Box<dyn Device>>,
}

impl Default for CachedSurfaces {
    fn default() -> Self {
        CachedSurfaces {
            cache: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_SURFACES).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }
}

impl CachedSurfaces {
    /// A cleared `width` x `height` surface for `key`, reused when a
    /// matching one is cached, otherwise created from `factory`.
    pub fn take(
        &mut self,
        key: SurfaceKey,
        width: u32,
        height: u32,
        factory: &dyn Device,
    ) -> PDFResult<Box<dyn Device>> {
        if let Some(mut device) = self.cache.pop(&key) {
            if device.width() == width && device.height() == height {
                trace!(?key, width, height, "Reusing cached surface");
                device.clear();
                return Ok(device);
            }
        }
        factory.create_offscreen(width, height)
    }

    pub fn put(&mut self, key: SurfaceKey, mut device: Box<dyn Device>) {
        // Leave no state behind for the next user.
        device.begin_path();
        self.cache.put(key, device);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
