use std::fmt;

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A granted resource.
///
/// Every successful acquisition hands one of these back. Releasing it,
/// explicitly via [`release`](Grant::release) or implicitly on drop, returns
/// the resource to the owning primitive exactly once; any further release is
/// a no-op. The release path holds only a weak back-reference, so releasing
/// after the primitive itself was dropped is also a no-op.
pub struct Grant {
    release: Option<ReleaseFn>,
}

impl Grant {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A grant that owns no resource (condition waits hand these out).
    pub(crate) fn inert() -> Self {
        Self::new(|| {})
    }

    /// Returns the resource. The first call runs the owner's release path;
    /// subsequent calls do nothing.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// True until the first release.
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Releasing twice must run the callback once.
    #[test]
    fn test_release_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_c = count.clone();
        let mut grant = Grant::new(move || {
            count_c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(grant.is_active());
        grant.release();
        assert!(!grant.is_active());
        grant.release();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Dropping an unreleased grant runs the release path.
    #[test]
    fn test_release_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_c = count.clone();
        {
            let _grant = Grant::new(move || {
                count_c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Dropping an already-released grant must not run the callback again.
    #[test]
    fn test_no_double_release_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_c = count.clone();
        {
            let mut grant = Grant::new(move || {
                count_c.fetch_add(1, Ordering::SeqCst);
            });
            grant.release();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Inert grants still flip their active flag.
    #[test]
    fn test_inert() {
        let mut grant = Grant::inert();
        assert!(grant.is_active());
        grant.release();
        assert!(!grant.is_active());
    }
}
