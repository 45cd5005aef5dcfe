use dashmap::DashMap;
use log::{debug, trace};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);
impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

#[derive(Debug)]
pub struct ContextInner {
    id: ContextId,
    alive: AtomicBool,
}

/// A script execution context (a frame's global object) that consumer
/// callbacks belong to.
///
/// Every callback handed to a facade is bound to the context it was created
/// in. Once the host unloads that context, anything still queued for it is
/// dropped instead of being delivered.
#[derive(Clone)]
pub struct ScriptContext {
    inner: Arc<ContextInner>,
}
impl PartialEq for ScriptContext {
    fn eq(&self, other: &ScriptContext) -> bool {
        Arc::<ContextInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for ScriptContext {}
impl Hash for ScriptContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<ContextInner>::as_ptr(&self.inner), state);
    }
}
impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ScriptContext {
    fn new(id: ContextId) -> Self {
        ScriptContext {
            inner: Arc::new(ContextInner { id, alive: AtomicBool::new(true) }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    fn close(&self) -> bool {
        self.inner.alive.swap(false, Ordering::AcqRel)
    }
}

/// Implemented by subsystems that keep per-context registrations so they can
/// forget them when the context goes away.
pub trait ContextObserver: Send + Sync {
    fn on_context_unloaded(&self, context: ContextId);
}

pub struct ContextManagerInner {
    next_id: AtomicU64,
    contexts: DashMap<ContextId, ScriptContext>,

    // Weak so that registering as an observer doesn't keep an adapter alive
    observers: StdRwLock<Vec<Weak<dyn ContextObserver>>>,
}

/// Tracks the live script contexts of the host
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<ContextManagerInner>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager {
            inner: Arc::new(ContextManagerInner {
                next_id: AtomicU64::new(1),
                contexts: DashMap::new(),
                observers: StdRwLock::new(Vec::new()),
            }),
        }
    }

    /// Called by the host when a new frame is loaded
    pub fn create(&self) -> ScriptContext {
        let id = ContextId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let context = ScriptContext::new(id);
        self.inner.contexts.insert(id, context.clone());
        trace!("Context {} created", id);
        context
    }

    pub fn get(&self, id: ContextId) -> Option<ScriptContext> {
        self.inner.contexts.get(&id).map(|entry| entry.value().clone())
    }

    pub fn is_alive(&self, id: ContextId) -> bool {
        self.inner.contexts.contains_key(&id)
    }

    pub fn add_observer(&self, observer: Weak<dyn ContextObserver>) {
        let mut observers = self.inner.observers.write().unwrap();
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    /// Called by the host when a frame is unloaded.
    ///
    /// The context is marked dead before observers are notified so that any
    /// job they (or a native thread) race to post is dropped at delivery.
    pub fn unload(&self, context: &ScriptContext) {
        self.unload_id(context.id());
    }

    pub fn unload_id(&self, id: ContextId) {
        let context = match self.inner.contexts.remove(&id) {
            Some((_, context)) => context,
            None => {
                debug!("Context {} already unloaded", id);
                return;
            }
        };
        context.close();
        debug!("Context {} unloaded", id);

        let observers: Vec<Arc<dyn ContextObserver>> = {
            let guard = self.inner.observers.read().unwrap();
            guard.iter().filter_map(|o| o.upgrade()).collect()
        };
        for observer in observers {
            observer.on_context_unloaded(id);
        }
    }

    pub fn unload_all(&self) {
        let ids: Vec<ContextId> = self.inner.contexts.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unload_id(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        unloaded: StdMutex<Vec<ContextId>>,
    }
    impl ContextObserver for Recorder {
        fn on_context_unloaded(&self, context: ContextId) {
            self.unloaded.lock().unwrap().push(context);
        }
    }

    #[test]
    fn unload_marks_dead_and_notifies() {
        let manager = ContextManager::new();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ContextObserver> = Arc::downgrade(&recorder) as Weak<dyn ContextObserver>;
        manager.add_observer(weak);

        let ctx0 = manager.create();
        let ctx1 = manager.create();
        assert_ne!(ctx0, ctx1);
        assert_eq!(manager.len(), 2);

        manager.unload(&ctx0);
        assert!(!ctx0.is_alive());
        assert!(ctx1.is_alive());
        assert!(!manager.is_alive(ctx0.id()));

        // A second unload of the same context doesn't notify twice
        manager.unload(&ctx0);
        assert_eq!(*recorder.unloaded.lock().unwrap(), vec![ctx0.id()]);
    }

    #[test]
    fn dropped_observers_are_skipped() {
        let manager = ContextManager::new();
        {
            let recorder = Arc::new(Recorder::default());
            manager.add_observer(Arc::downgrade(&recorder) as Weak<dyn ContextObserver>);
        }
        let ctx = manager.create();
        manager.unload_all();
        assert!(!ctx.is_alive());
        assert!(manager.is_empty());
    }
}
