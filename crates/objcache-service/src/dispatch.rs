//! Running item construction on a designated execution context.
//!
//! Some item types may only be created on one particular thread. A loader configured with an
//! [`ExecutionContext`] sends its construction work there and awaits the result; without one,
//! the work runs wherever the caller is.

use std::fmt;
use std::future::Future;
use std::io;
use std::thread::ThreadId;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::caching::{CacheContents, CacheError};

/// A unit of work sent to an [`ExecutionContext`].
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A place that runs [`Job`]s, typically a single dedicated thread.
pub trait ExecutionContext: fmt::Debug + Send + Sync {
    /// Whether the calling thread already is the execution context, so work can run inline.
    fn has_thread_access(&self) -> bool;

    /// Hands `job` to the context, returning `false` if it cannot accept work.
    fn try_enqueue(&self, job: Job) -> bool;
}

/// Runs `work` on `context` and waits for its result.
///
/// The work runs inline when there is no context, or when the caller already is on it. A context
/// that refuses the work, or drops it before it completes, yields
/// [`CacheError::SchedulingFailed`].
pub async fn run_on<T, F, Fut>(context: Option<&dyn ExecutionContext>, work: F) -> CacheContents<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = CacheContents<T>> + Send + 'static,
{
    let Some(context) = context.filter(|context| !context.has_thread_access()) else {
        return work().await;
    };

    let (sender, receiver) = oneshot::channel();
    let job: Job = Box::new(move || {
        async move {
            // the caller may have stopped waiting
            let _ = sender.send(work().await);
        }
        .boxed()
    });

    if !context.try_enqueue(job) {
        tracing::warn!("Execution context {:?} refused work", context);
        return Err(CacheError::SchedulingFailed);
    }

    receiver.await.unwrap_or_else(|_| {
        tracing::warn!("Execution context {:?} dropped work", context);
        Err(CacheError::SchedulingFailed)
    })
}

/// An [`ExecutionContext`] backed by one dedicated, named thread.
///
/// Jobs run one after the other, in the order they were enqueued, on a current-thread tokio
/// runtime owned by the thread. At most `queue_size` jobs wait at any time; further jobs are
/// refused. The thread exits once the executor is dropped and the queue is drained.
pub struct SerialExecutor {
    name: String,
    sender: mpsc::Sender<Job>,
    thread_id: ThreadId,
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("queued", &(self.sender.max_capacity() - self.sender.capacity()))
            .finish()
    }
}

impl SerialExecutor {
    pub fn new(name: &str, queue_size: usize) -> io::Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<Job>(queue_size.max(1));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = receiver.recv().await {
                        job().await;
                    }
                });
            })?;

        tracing::debug!("Started serial executor `{}`", name);
        Ok(Self {
            name: name.to_owned(),
            sender,
            thread_id: thread.thread().id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExecutionContext for SerialExecutor {
    fn has_thread_access(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn try_enqueue(&self, job: Job) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Queue of `{}` is full", self.name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Serial executor `{}` is gone", self.name);
                false
            }
        }
    }
}
