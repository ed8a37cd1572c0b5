//! Serialized single-consumer task queue. All state owned by the queue's
//! worker context is mutated only from task execution, which substitutes
//! for fine-grained locking across the recovery control plane.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::utils::KeystoneError;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// A one-shot work item executed on the queue's worker.
pub(crate) trait Task: Send + 'static {
    /// Worker-side context the item runs against.
    type Ctx: Send + 'static;

    /// Carries out the item. Consumes it; re-submission means building a
    /// new item.
    fn perform(self, ctx: &mut Self::Ctx);
}

/// Internal channel payload: a work item or a flush barrier.
enum QueueItem<T> {
    Work(T),
    Flush(oneshot::Sender<()>),
}

/// Cloneable submission handle onto a `TaskQueue`. Work items run strictly
/// in submission order, and items submitted from within a running item
/// execute after the current item returns.
pub(crate) struct TaskSubmitter<T> {
    /// Sender side of the task channel.
    tx_task: mpsc::UnboundedSender<QueueItem<T>>,

    /// Number of submitted work items not yet performed.
    num_pending: Arc<AtomicUsize>,
}

impl<T> Clone for TaskSubmitter<T> {
    fn clone(&self) -> Self {
        TaskSubmitter {
            tx_task: self.tx_task.clone(),
            num_pending: self.num_pending.clone(),
        }
    }
}

impl<T: Task> TaskSubmitter<T> {
    /// Enqueues a work item.
    pub(crate) fn submit(&self, task: T) -> Result<(), KeystoneError> {
        self.num_pending.fetch_add(1, Ordering::SeqCst);
        self.tx_task.send(QueueItem::Work(task)).map_err(|e| {
            self.num_pending.fetch_sub(1, Ordering::SeqCst);
            KeystoneError(format!("task channel closed: {}", e))
        })
    }
}

/// Single-consumer serialized task queue.
///
/// The worker context `Ctx` is owned by the background worker while the
/// queue is started and parked inside the queue while it is halted, so
/// tasks need no synchronization among themselves. `start` and `halt` are
/// serialized by `&mut self`.
pub(crate) struct TaskQueue<T: Task> {
    /// Sender side of the task channel.
    tx_task: mpsc::UnboundedSender<QueueItem<T>>,

    /// Halt signal to the worker.
    tx_halt: watch::Sender<bool>,

    /// Number of submitted work items not yet performed.
    num_pending: Arc<AtomicUsize>,

    /// Receiver side of the task channel and the worker context, parked
    /// here while no worker is running.
    parked: Option<(mpsc::UnboundedReceiver<QueueItem<T>>, T::Ctx)>,

    /// Join handle of the running worker, if any.
    worker: Option<JoinHandle<(mpsc::UnboundedReceiver<QueueItem<T>>, T::Ctx)>>,
}

impl<T: Task> TaskQueue<T> {
    /// Creates a new halted queue. The worker context is built by the given
    /// closure, which receives a submission handle so that the context can
    /// enqueue follow-up items while performing one.
    pub(crate) fn new<F>(build_ctx: F) -> Self
    where
        F: FnOnce(TaskSubmitter<T>) -> T::Ctx,
    {
        let (tx_task, rx_task) = mpsc::unbounded_channel();
        let (tx_halt, _) = watch::channel(false);
        let num_pending = Arc::new(AtomicUsize::new(0));
        let ctx = build_ctx(TaskSubmitter {
            tx_task: tx_task.clone(),
            num_pending: num_pending.clone(),
        });
        TaskQueue {
            tx_task,
            tx_halt,
            num_pending,
            parked: Some((rx_task, ctx)),
            worker: None,
        }
    }

    /// Returns a cloneable submission handle.
    pub(crate) fn submitter(&self) -> TaskSubmitter<T> {
        TaskSubmitter {
            tx_task: self.tx_task.clone(),
            num_pending: self.num_pending.clone(),
        }
    }

    /// Enqueues a work item. Items submitted while halted stay queued for
    /// the next `start`.
    pub(crate) fn submit(&self, task: T) -> Result<(), KeystoneError> {
        self.submitter().submit(task)
    }

    /// Number of submitted work items not yet performed.
    pub(crate) fn num_pending(&self) -> usize {
        self.num_pending.load(Ordering::SeqCst)
    }

    /// Worker-side context; available only while halted.
    #[allow(dead_code)]
    pub(crate) fn ctx(&self) -> Option<&T::Ctx> {
        self.parked.as_ref().map(|(_, ctx)| ctx)
    }

    /// Launches the worker if it is not already running.
    pub(crate) fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        if let Some((rx_task, ctx)) = self.parked.take() {
            self.tx_halt.send_replace(false);
            let rx_halt = self.tx_halt.subscribe();
            let num_pending = self.num_pending.clone();
            self.worker = Some(tokio::spawn(Self::worker_loop(
                rx_task,
                ctx,
                rx_halt,
                num_pending,
            )));
        }
    }

    /// Signals the worker to stop after the item it is currently
    /// performing, joins it, and drops any still-queued items. Idempotent;
    /// `start` may be called afterwards to resume with the same context.
    pub(crate) async fn halt(&mut self) -> Result<(), KeystoneError> {
        self.tx_halt.send_replace(true);
        if let Some(handle) = self.worker.take() {
            let (mut rx_task, ctx) = handle.await?;
            Self::drop_queued(&mut rx_task, &self.num_pending);
            self.parked = Some((rx_task, ctx));
        } else if let Some((rx_task, _)) = self.parked.as_mut() {
            Self::drop_queued(rx_task, &self.num_pending);
        }
        Ok(())
    }

    /// Waits until every item submitted before this call has been
    /// performed. Errs if the queue is halted before the barrier is
    /// reached; hangs if the queue was never started.
    pub(crate) async fn flush(&self) -> Result<(), KeystoneError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_task
            .send(QueueItem::Flush(tx_done))
            .map_err(|e| KeystoneError(format!("task channel closed: {}", e)))?;
        rx_done.await?;
        Ok(())
    }

    /// Discards queued items that will never be performed.
    fn drop_queued(
        rx_task: &mut mpsc::UnboundedReceiver<QueueItem<T>>,
        num_pending: &Arc<AtomicUsize>,
    ) {
        while let Ok(item) = rx_task.try_recv() {
            if let QueueItem::Work(_) = item {
                num_pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Worker loop: performs items in submission order until halted, then
    /// hands the channel and context back for parking.
    async fn worker_loop(
        mut rx_task: mpsc::UnboundedReceiver<QueueItem<T>>,
        mut ctx: T::Ctx,
        mut rx_halt: watch::Receiver<bool>,
        num_pending: Arc<AtomicUsize>,
    ) -> (mpsc::UnboundedReceiver<QueueItem<T>>, T::Ctx) {
        ks_debug!("taskq"; "worker spawned");
        loop {
            tokio::select! {
                biased;

                changed = rx_halt.changed() => {
                    if changed.is_err() || *rx_halt.borrow() {
                        break;
                    }
                },

                item = rx_task.recv() => {
                    match item {
                        Some(QueueItem::Work(task)) => {
                            task.perform(&mut ctx);
                            num_pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        Some(QueueItem::Flush(tx_done)) => {
                            // barrier; the waiter may have given up already
                            let _ = tx_done.send(());
                        }
                        None => break, // all senders gone
                    }
                },
            }
        }
        ks_debug!("taskq"; "worker exitted");
        (rx_task, ctx)
    }
}

#[cfg(test)]
mod taskqueue_tests {
    use super::*;

    /// Context recording performed item tags; `Spawn` items chain a
    /// follow-up submission from within the worker.
    struct TestCtx {
        performed: Vec<u64>,
        submitter: TaskSubmitter<TestTask>,
    }

    enum TestTask {
        Tag(u64),
        Spawn { tag: u64, then: u64 },
    }

    impl Task for TestTask {
        type Ctx = TestCtx;

        fn perform(self, ctx: &mut TestCtx) {
            match self {
                TestTask::Tag(tag) => ctx.performed.push(tag),
                TestTask::Spawn { tag, then } => {
                    ctx.performed.push(tag);
                    ctx.submitter.submit(TestTask::Tag(then)).unwrap();
                }
            }
        }
    }

    fn test_queue() -> TaskQueue<TestTask> {
        TaskQueue::new(|submitter| TestCtx {
            performed: vec![],
            submitter,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submission_order() -> Result<(), KeystoneError> {
        let mut queue = test_queue();
        queue.start();
        for tag in 0..10 {
            queue.submit(TestTask::Tag(tag))?;
        }
        queue.flush().await?;
        queue.halt().await?;
        assert_eq!(
            queue.ctx().unwrap().performed,
            (0..10).collect::<Vec<u64>>()
        );
        assert_eq!(queue.num_pending(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chained_submission() -> Result<(), KeystoneError> {
        let mut queue = test_queue();
        queue.start();
        queue.submit(TestTask::Spawn { tag: 1, then: 3 })?;
        queue.submit(TestTask::Tag(2))?;
        while queue.num_pending() > 0 {
            queue.flush().await?;
        }
        queue.halt().await?;
        // the chained item runs after items already queued at spawn time
        assert_eq!(queue.ctx().unwrap().performed, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn halt_drops_queued() -> Result<(), KeystoneError> {
        let mut queue = test_queue();
        queue.start();
        queue.submit(TestTask::Tag(1))?;
        queue.flush().await?;
        queue.halt().await?;

        // queued while halted, then dropped by the second halt
        queue.submit(TestTask::Tag(2))?;
        assert_eq!(queue.num_pending(), 1);
        queue.halt().await?;
        assert_eq!(queue.num_pending(), 0);

        queue.start();
        queue.submit(TestTask::Tag(3))?;
        queue.flush().await?;
        queue.halt().await?;
        assert_eq!(queue.ctx().unwrap().performed, vec![1, 3]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resumes_context() -> Result<(), KeystoneError> {
        let mut queue = test_queue();
        queue.start();
        queue.start(); // no effect
        queue.submit(TestTask::Tag(7))?;
        queue.flush().await?;
        queue.halt().await?;
        queue.halt().await?; // no effect

        queue.start();
        queue.submit(TestTask::Tag(8))?;
        queue.flush().await?;
        queue.halt().await?;
        assert_eq!(queue.ctx().unwrap().performed, vec![7, 8]);
        Ok(())
    }
}
