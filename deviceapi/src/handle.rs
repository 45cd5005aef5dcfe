use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{trace, warn};

use crate::{NativeHandle, Result};

/// The two release actions of a [`HandleWrapper`].
///
/// `unreferenced` runs when only one copy is left, which for a registry
/// owned handle is the registry's own bookkeeping copy. That's the hook's
/// chance to erase the registry entry, which drops the final copy and leads
/// to `destroy`.
pub trait ReleaseHooks: Send + Sync {
    fn unreferenced(&self, handle: NativeHandle);
    fn destroy(&self, handle: NativeHandle) -> Result<()>;
}

struct HandleCell {
    handle: NativeHandle,
    refs: AtomicUsize,
    hooks: Box<dyn ReleaseHooks>,
}

/// A counted, shared owner of a native handle.
///
/// Every copy refers to the same count. Dropping a copy decrements it: the
/// drop that leaves one copy runs [`ReleaseHooks::unreferenced`], and the final
/// drop runs [`ReleaseHooks::destroy`] exactly once.
pub struct HandleWrapper {
    cell: Arc<HandleCell>,
}

impl HandleWrapper {
    pub fn acquire(handle: NativeHandle, hooks: Box<dyn ReleaseHooks>) -> Self {
        trace!("Acquired native handle {}", handle);
        HandleWrapper {
            cell: Arc::new(HandleCell {
                handle,
                refs: AtomicUsize::new(1),
                hooks,
            }),
        }
    }

    pub fn handle(&self) -> NativeHandle {
        self.cell.handle
    }

    pub fn ref_count(&self) -> usize {
        self.cell.refs.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &HandleWrapper) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Clone for HandleWrapper {
    fn clone(&self) -> Self {
        self.cell.refs.fetch_add(1, Ordering::AcqRel);
        HandleWrapper { cell: self.cell.clone() }
    }
}

impl Drop for HandleWrapper {
    fn drop(&mut self) {
        let handle = self.cell.handle;
        match self.cell.refs.fetch_sub(1, Ordering::AcqRel) {
            2 => {
                trace!("Native handle {} only referenced by its owner", handle);
                self.cell.hooks.unreferenced(handle);
            }
            1 => {
                trace!("Destroying native handle {}", handle);
                if let Err(err) = self.cell.hooks.destroy(handle) {
                    warn!("Failed to destroy native handle {}: {}", handle, err);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for HandleWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleWrapper")
            .field("handle", &self.cell.handle)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct Counts {
        log: Arc<StdMutex<Vec<(&'static str, usize)>>>,
        drops: Arc<AtomicUsize>,
    }

    struct CountingHooks {
        counts: Counts,
        fail_destroy: bool,
    }
    impl ReleaseHooks for CountingHooks {
        fn unreferenced(&self, _handle: NativeHandle) {
            let drops = self.counts.drops.load(Ordering::SeqCst);
            self.counts.log.lock().unwrap().push(("unreferenced", drops));
        }
        fn destroy(&self, _handle: NativeHandle) -> Result<()> {
            let drops = self.counts.drops.load(Ordering::SeqCst);
            self.counts.log.lock().unwrap().push(("destroy", drops));
            if self.fail_destroy {
                Err(Error::Unknown("destroy failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn wrapper(counts: &Counts, fail_destroy: bool) -> HandleWrapper {
        HandleWrapper::acquire(
            NativeHandle(7),
            Box::new(CountingHooks { counts: counts.clone(), fail_destroy }),
        )
    }

    #[test]
    fn two_phase_release_after_n_copies() {
        for n in 0..6 {
            let counts = Counts::default();
            let original = wrapper(&counts, false);
            let mut copies: Vec<HandleWrapper> = (0..n).map(|_| original.clone()).collect();
            copies.push(original);
            assert_eq!(copies[0].ref_count(), n + 1);

            while let Some(copy) = copies.pop() {
                counts.drops.fetch_add(1, Ordering::SeqCst);
                drop(copy);
            }

            let log = counts.log.lock().unwrap().clone();
            let destroys: Vec<_> = log.iter().filter(|(what, _)| *what == "destroy").collect();
            assert_eq!(destroys.len(), 1);
            assert_eq!(destroys[0].1, n + 1);
            if n == 0 {
                // A lone wrapper never passes through the "one copy left" state
                assert_eq!(log.len(), 1);
            } else {
                let unrefs: Vec<_> = log.iter().filter(|(what, _)| *what == "unreferenced").collect();
                assert_eq!(unrefs.len(), 1);
                assert_eq!(unrefs[0].1, n);
            }
        }
    }

    #[test]
    fn destroy_failure_is_swallowed() {
        let counts = Counts::default();
        let w = wrapper(&counts, true);
        drop(w);
        assert_eq!(counts.log.lock().unwrap().len(), 1);
    }

    #[test]
    fn copies_alias_one_cell() {
        let counts = Counts::default();
        let a = wrapper(&counts, false);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_eq!(b.handle(), NativeHandle(7));
        drop(a);
        assert_eq!(b.ref_count(), 1);
    }
}
