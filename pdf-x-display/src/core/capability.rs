//! One-shot completion handles.
//!
//! A [`Capability`] is settled at most once, either with a value or with an
//! error. Any number of waiters may await it, before or after settlement.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use super::error::{PDFError, PDFResult};

type Slot<T> = Option<Result<T, PDFError>>;

/// A resolvable/rejectable one-shot result.
#[derive(Debug)]
pub struct Capability<T> {
    slot: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Capability<T> {
    fn clone(&self) -> Self {
        Capability {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Capability<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Capability<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Capability {
            slot: Arc::new(slot),
        }
    }

    /// Settles with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with an error. Returns `false` if already settled.
    pub fn reject(&self, error: PDFError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, PDFError>) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Current outcome, if settled.
    pub fn try_get(&self) -> Option<PDFResult<T>> {
        self.slot.borrow().clone()
    }

    /// A future for the outcome that does not borrow the capability.
    pub fn promise(&self) -> impl Future<Output = PDFResult<T>> + Send + 'static + use<T> {
        let mut receiver = self.slot.subscribe();
        async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(slot) => slot
                    .clone()
                    .unwrap_or_else(|| Err(PDFError::Generic("capability was not settled".into()))),
                Err(_) => Err(PDFError::abort("capability dropped")),
            }
        }
    }

    /// Whether both handles settle the same outcome.
    pub fn same_as(&self, other: &Capability<T>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let capability = Capability::new();
        assert!(!capability.settled());

        assert!(capability.resolve(1));
        assert!(!capability.resolve(2));
        assert!(!capability.reject(PDFError::abort("late")));

        assert_eq!(capability.promise().await, Ok(1));
        assert_eq!(capability.try_get(), Some(Ok(1)));
    }

    #[tokio::test]
    async fn test_waiters_registered_before_settlement() {
        let capability: Capability<String> = Capability::new();
        let first = tokio::spawn(capability.promise());
        let second = tokio::spawn(capability.promise());

        tokio::task::yield_now().await;
        capability.reject(PDFError::InvalidPdf("bad".into()));

        assert_eq!(
            first.await.unwrap(),
            Err(PDFError::InvalidPdf("bad".into()))
        );
        assert_eq!(
            second.await.unwrap(),
            Err(PDFError::InvalidPdf("bad".into()))
        );
    }

    #[test]
    fn test_clones_share_state() {
        let capability = Capability::new();
        let clone = capability.clone();

        clone.resolve(());
        assert!(capability.settled());
        assert!(capability.same_as(&clone));
        assert!(!capability.same_as(&Capability::new()));
    }
}
