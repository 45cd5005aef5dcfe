use std::fmt;
use std::sync::Arc;

use log::trace;
use tokio::sync::{mpsc, oneshot};

use crate::context::ScriptContext;
use crate::Result;

/// A single-use consumer callback: it's invoked exactly once with either a
/// value or an error and is consumed by the invocation.
///
/// Replies are never invoked directly by facades, they are handed to the
/// [`Dispatcher`](crate::Dispatcher) so that delivery happens on the event
/// loop, and only while the owning context is still alive.
pub struct Reply<T> {
    context: ScriptContext,
    handler: Box<dyn FnOnce(Result<T>) + Send + Sync>,
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").field("context", &self.context).finish()
    }
}

impl<T: 'static> Reply<T> {
    pub fn new<F>(context: &ScriptContext, handler: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + Sync + 'static,
    {
        Reply {
            context: context.clone(),
            handler: Box::new(handler),
        }
    }

    /// Creates a reply that forwards its result into a oneshot channel, for
    /// consumers that would rather `.await` a result than take a callback.
    pub fn channel(context: &ScriptContext) -> (Self, oneshot::Receiver<Result<T>>)
    where
        T: Send,
    {
        let (tx, rx) = oneshot::channel();
        let reply = Reply::new(context, move |result| {
            if tx.send(result).is_err() {
                trace!("Reply receiver dropped before delivery");
            }
        });
        (reply, rx)
    }

    pub fn context(&self) -> &ScriptContext {
        &self.context
    }

    pub(crate) fn invoke(self, result: Result<T>) {
        (self.handler)(result)
    }
}

/// A multi-shot consumer callback, registered in a
/// [`CallbackRegistry`](crate::CallbackRegistry) or kept by a facade for the
/// duration of a scan, an advertisement or a detection session.
pub struct Listener<T> {
    context: ScriptContext,
    handler: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Listener {
            context: self.context.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("context", &self.context).finish()
    }
}

impl<T: 'static> Listener<T> {
    pub fn new<F>(context: &ScriptContext, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Listener {
            context: context.clone(),
            handler: Arc::new(handler),
        }
    }

    /// Creates a listener that forwards everything it's given to an unbounded
    /// channel.
    pub fn channel(context: &ScriptContext) -> (Self, mpsc::UnboundedReceiver<T>)
    where
        T: Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::new(context, move |value| {
            if tx.send(value).is_err() {
                trace!("Listener receiver dropped");
            }
        });
        (listener, rx)
    }

    pub fn context(&self) -> &ScriptContext {
        &self.context
    }

    pub(crate) fn invoke(&self, value: T) {
        (self.handler)(value)
    }
}
