//! Id-keyed pools of decoded resources (fonts, glyph outlines, images).
//!
//! There is one pool per document for common objects and one per page.
//! Every id resolves at most once; later resolutions are ignored.

use std::future::Future;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;

use super::capability::Capability;
use super::error::{PDFError, PDFResult};
use super::font::{FontResource, PathCommand};
use super::image::ImageBitmap;
use super::lock;

/// A resolved pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolObject {
    Font(Arc<FontResource>),
    FontPath(Arc<Vec<PathCommand>>),
    FontType3Res,
    Image(Arc<ImageBitmap>),
}

impl PoolObject {
    pub fn as_font(&self) -> Option<&Arc<FontResource>> {
        match self {
            PoolObject::Font(font) => Some(font),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Arc<ImageBitmap>> {
        match self {
            PoolObject::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_font_path(&self) -> Option<&Arc<Vec<PathCommand>>> {
        match self {
            PoolObject::FontPath(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct PDFObjects {
    objs: Mutex<FxHashMap<String, Capability<PoolObject>>>,
}

impl PDFObjects {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&self, id: &str) -> Capability<PoolObject> {
        lock(&self.objs)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// The resolved object, or `ObjectNotResolved` if it has not arrived yet.
    pub fn get(&self, id: &str) -> PDFResult<PoolObject> {
        let capability = lock(&self.objs).get(id).cloned();
        match capability.and_then(|capability| capability.try_get()) {
            Some(outcome) => outcome,
            None => Err(PDFError::ObjectNotResolved(id.to_string())),
        }
    }

    /// Waits until `id` resolves. Fails with `Abort` if the pool is cleared
    /// first.
    pub fn get_async(&self, id: &str) -> impl Future<Output = PDFResult<PoolObject>> + Send + 'static + use<> {
        self.ensure(id).promise()
    }

    pub fn has(&self, id: &str) -> bool {
        lock(&self.objs)
            .get(id)
            .is_some_and(|capability| matches!(capability.try_get(), Some(Ok(_))))
    }

    /// Resolves `id`. Returns `false` when it was already resolved.
    pub fn resolve(&self, id: &str, object: PoolObject) -> bool {
        let resolved = self.ensure(id).resolve(object);
        if !resolved {
            debug!(id, "Ignoring second resolution of pool object");
        }
        resolved
    }

    /// Fails `id` so its waiters stop waiting. Returns `false` when it was
    /// already settled.
    pub fn reject(&self, id: &str, error: PDFError) -> bool {
        let rejected = self.ensure(id).reject(error);
        if !rejected {
            debug!(id, "Ignoring rejection of settled pool object");
        }
        rejected
    }

    pub fn len(&self) -> usize {
        lock(&self.objs).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objs).is_empty()
    }

    /// Forgets every entry; waiters still pending fail with `Abort`.
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.objs).drain().map(|(_, entry)| entry).collect();
        for capability in drained {
            capability.reject(PDFError::abort("Object pool was cleared."));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_before_resolve_fails() {
        let objs = PDFObjects::new();
        assert_eq!(
            objs.get("img_p0_1"),
            Err(PDFError::ObjectNotResolved("img_p0_1".into()))
        );
        assert!(!objs.has("img_p0_1"));
    }

    #[test]
    fn test_first_resolution_wins() {
        let objs = PDFObjects::new();
        assert!(objs.resolve("g_d0_f1", PoolObject::FontType3Res));
        assert!(!objs.resolve(
            "g_d0_f1",
            PoolObject::FontPath(Arc::new(vec![PathCommand::ClosePath]))
        ));
        assert_eq!(objs.get("g_d0_f1").unwrap(), PoolObject::FontType3Res);
    }

    #[tokio::test]
    async fn test_get_async_waits_for_resolution() {
        let objs = Arc::new(PDFObjects::new());
        let waiter = tokio::spawn(objs.get_async("img_p0_2"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        objs.resolve("img_p0_2", PoolObject::FontType3Res);
        assert_eq!(waiter.await.unwrap().unwrap(), PoolObject::FontType3Res);
    }

    #[tokio::test]
    async fn test_reject_fails_waiters_once() {
        let objs = PDFObjects::new();
        let pending = objs.get_async("img_p0_5");

        assert!(objs.reject("img_p0_5", PDFError::RenderingError("corrupt".into())));
        assert!(!objs.resolve("img_p0_5", PoolObject::FontType3Res));

        assert_eq!(pending.await, Err(PDFError::RenderingError("corrupt".into())));
        assert!(!objs.has("img_p0_5"));
        assert!(objs.get("img_p0_5").is_err());
        // Late waiters see the same failure.
        assert!(objs.get_async("img_p0_5").await.is_err());
    }

    #[tokio::test]
    async fn test_clear_rejects_waiters() {
        let objs = PDFObjects::new();
        let pending = objs.get_async("img_p0_3");
        objs.resolve("img_p0_4", PoolObject::FontType3Res);

        objs.clear();

        assert!(matches!(pending.await, Err(PDFError::Abort(_))));
        assert!(objs.is_empty());
        assert!(!objs.has("img_p0_4"));
    }
}
