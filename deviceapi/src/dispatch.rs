use std::fmt;

use futures::StreamExt;
use log::{debug, trace};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::callback::{Listener, Reply};
use crate::context::ScriptContext;
use crate::{Error, Result};

/// A one-shot unit of work bound to the context whose consumer code it will
/// run.
pub struct DeferredJob {
    context: ScriptContext,
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for DeferredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredJob")
            .field("label", &self.label)
            .field("context", &self.context)
            .finish()
    }
}

impl DeferredJob {
    pub fn new<F>(context: &ScriptContext, label: &'static str, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        DeferredJob {
            context: context.clone(),
            label,
            run: Box::new(run),
        }
    }

    /// Runs the job unless its context has been closed in the meantime.
    ///
    /// Either way the job (and whatever callback it owns) is consumed.
    /// Returns whether the job was delivered.
    pub fn execute(self) -> bool {
        if !self.context.is_alive() {
            debug!("{}: context was closed, dropping job", self.label);
            return false;
        }
        trace!("{}: delivering", self.label);
        (self.run)();
        true
    }
}

/// The posting side of the idle queue.
///
/// Cheap to clone and safe to call from any thread, including native SDK
/// callback threads. Posting never blocks and never runs consumer code.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<DeferredJob>,
}

/// The consuming side of the idle queue: jobs run here in FIFO post order.
#[derive(Debug)]
pub struct EventLoop {
    jobs: mpsc::UnboundedReceiver<DeferredJob>,
}

pub fn idle_queue() -> (Dispatcher, EventLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { queue: tx }, EventLoop { jobs: rx })
}

impl Dispatcher {
    pub fn post(&self, job: DeferredJob) -> Result<()> {
        self.queue.send(job).map_err(|err| {
            log::error!("Failed to post {}: event loop is gone", err.0.label);
            Error::Unknown("Failed to schedule callback".to_string())
        })
    }

    pub fn post_fn<F>(&self, context: &ScriptContext, label: &'static str, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Failure is already logged and the job freed
        let _ = self.post(DeferredJob::new(context, label, run));
    }

    /// Schedules delivery of a result to a single-use reply
    pub fn reply<T: Send + 'static>(&self, label: &'static str, reply: Reply<T>, result: Result<T>) {
        let context = reply.context().clone();
        self.post_fn(&context, label, move || reply.invoke(result));
    }

    /// Schedules one delivery to a listener
    pub fn notify<T: Send + 'static>(&self, label: &'static str, listener: &Listener<T>, value: T) {
        let listener = listener.clone();
        let context = listener.context().clone();
        self.post_fn(&context, label, move || listener.invoke(value));
    }
}

impl EventLoop {
    /// Runs every job that is currently queued, including jobs posted by the
    /// jobs themselves, and returns how many were delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(job) = self.jobs.try_recv() {
            if job.execute() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Runs jobs as they are posted until every [`Dispatcher`] is dropped
    pub async fn run(self) {
        trace!("Starting task to process deferred jobs...");
        let mut stream = UnboundedReceiverStream::new(self.jobs);
        while let Some(job) = stream.next().await {
            job.execute();
        }
        trace!("Finished task processing deferred jobs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn jobs_run_in_post_order() {
        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (dispatcher, mut event_loop) = idle_queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            dispatcher.post_fn(&ctx, "test", move || log.lock().unwrap().push(i));
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(event_loop.run_until_idle(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dead_context_drops_job_and_frees_callback() {
        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (dispatcher, mut event_loop) = idle_queue();

        let token = Arc::new(());
        let held = token.clone();
        let (reply, mut rx) = Reply::<u32>::channel(&ctx);
        dispatcher.reply("test", reply, Ok(1));
        dispatcher.post_fn(&ctx, "test", move || drop(held));

        contexts.unload(&ctx);
        assert_eq!(event_loop.run_until_idle(), 0);

        // The job's captures were released on the drop path too
        assert_eq!(Arc::strong_count(&token), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn jobs_posted_while_draining_also_run() {
        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (dispatcher, mut event_loop) = idle_queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_log = log.clone();
        let inner_dispatcher = dispatcher.clone();
        let inner_ctx = ctx.clone();
        dispatcher.post_fn(&ctx, "outer", move || {
            inner_log.lock().unwrap().push("outer");
            let log = inner_log.clone();
            inner_dispatcher.post_fn(&inner_ctx, "inner", move || log.lock().unwrap().push("inner"));
        });
        assert_eq!(event_loop.run_until_idle(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn post_after_loop_dropped_fails() {
        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (dispatcher, event_loop) = idle_queue();
        drop(event_loop);
        let err = dispatcher.post(DeferredJob::new(&ctx, "test", || {})).unwrap_err();
        assert!(matches!(err, Error::Unknown(_)));
    }

    #[tokio::test]
    async fn spawned_loop_delivers() {
        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (dispatcher, event_loop) = idle_queue();
        let task = tokio::spawn(event_loop.run());

        let (reply, rx) = Reply::<&'static str>::channel(&ctx);
        dispatcher.reply("test", reply, Ok("hello"));
        assert_eq!(rx.await.unwrap(), Ok("hello"));

        drop(dispatcher);
        task.await.unwrap();
    }
}
