//! Queue (§5/§6): the admission-control boundary between webhook ingress and
//! the Orchestrator. One driver runs two cooperating long-lived tasks — a
//! producer pump moving jobs from an in-process channel onto the external
//! queue, and a consumer loop delivering at most one in-flight job to the
//! handler at a time — mirroring the daemon lineage's listener-task /
//! engine-loop split.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use inspectd_retry::{RetryExecutor, RetryPolicy};
use inspectd_types::{Job, ShutdownState};
use tokio::sync::{Notify, mpsc};

/// `enqueue`/`consume` per §6. `enqueue` may buffer; `consume` is a
/// long-lived call that delivers one job at a time and only advances past a
/// job once the handler returns without an internal error — there is no
/// separate ack call, the handler's `Ok` return IS the acknowledgement.
pub trait Queue: Send + Sync {
    fn enqueue(&self, job: Job);
    fn try_dequeue(&self) -> Option<Job>;
}

/// `QUEUE=memory`: a mutex-guarded `VecDeque` plus a `Notify` the consumer
/// loop waits on. This is one of the three shared-mutable-state items
/// permitted by §5 (the other two are the DB pool, not present here since
/// persistence is in-memory, and the shutdown flag).
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    buffer: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn wait_for_job(&self) -> Job {
        loop {
            if let Some(job) = self.try_dequeue() {
                return job;
            }
            self.notify.notified().await;
        }
    }
}

impl Queue for InMemoryQueue {
    fn enqueue(&self, job: Job) {
        self.buffer.lock().expect("queue mutex poisoned").push_back(job);
        self.notify.notify_one();
    }

    fn try_dequeue(&self) -> Option<Job> {
        self.buffer.lock().expect("queue mutex poisoned").pop_front()
    }
}

/// Moves jobs from `inbox` onto `queue`, retrying each publish under
/// [`RetryPolicy::QueuePublish`] (§7: up to 3 attempts, linear backoff).
/// `InMemoryQueue::enqueue` cannot itself fail, so the retry loop is always
/// trivially satisfied on attempt 1 here; it exists so a `QUEUE=gcppubsub`
/// implementation can be dropped in without touching this pump.
pub async fn run_producer_pump(
    queue: Arc<dyn Queue>,
    mut inbox: mpsc::Receiver<Job>,
    shutdown: ShutdownState,
) {
    let executor = RetryExecutor::from_policy(RetryPolicy::QueuePublish);
    while let Some(job) = inbox.recv().await {
        if shutdown.is_shutting_down() {
            tracing::warn!("dropping job received during shutdown");
            continue;
        }
        let result: Result<(), std::convert::Infallible> = executor.run(|attempt| {
            if attempt > 1 {
                tracing::warn!(attempt, "retrying queue publish");
            }
            queue.enqueue(job.clone());
            Ok(())
        });
        let _ = result;
    }
}

/// Delivers jobs to `handler` one at a time (max-outstanding = 1, per §6),
/// stopping as soon as `shutdown` is observed so in-flight work can drain
/// without new jobs starting.
pub async fn run_consumer_loop<F>(queue: Arc<dyn Queue>, shutdown: ShutdownState, mut handler: F)
where
    F: FnMut(Job),
{
    let poll_queue = |q: &dyn Queue| q.try_dequeue();
    loop {
        if shutdown.is_shutting_down() {
            return;
        }
        match poll_queue(queue.as_ref()) {
            Some(job) => handler(job),
            None => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspectd_types::{EventKind, RepositoryRef, Revision};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_job() -> Job {
        Job {
            event: EventKind::Push,
            repository: RepositoryRef {
                id: 1,
                url: "https://example.com/repo.git".into(),
            },
            head: Revision::new("https://example.com/repo.git", "abc"),
            base: Revision::new("https://example.com/repo.git", "def"),
            request_number: 0,
            installation_id: 1,
        }
    }

    #[test]
    fn enqueue_then_dequeue_preserves_fifo_order() {
        let queue = InMemoryQueue::new();
        let mut first = sample_job();
        first.head.reference = "first".into();
        let mut second = sample_job();
        second.head.reference = "second".into();

        queue.enqueue(first);
        queue.enqueue(second);

        assert_eq!(queue.try_dequeue().unwrap().head.reference, "first");
        assert_eq!(queue.try_dequeue().unwrap().head.reference, "second");
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn wait_for_job_resolves_once_a_job_is_enqueued() {
        let queue = Arc::new(InMemoryQueue::new());
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.wait_for_job().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.enqueue(sample_job());

        let job = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait_for_job timed out")
            .expect("task panicked");
        assert_eq!(job.installation_id, 1);
    }

    #[tokio::test]
    async fn consumer_loop_stops_once_shutdown_begins() {
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let shutdown = ShutdownState::new();
        let processed = Arc::new(AtomicUsize::new(0));

        queue.enqueue(sample_job());
        shutdown.begin_shutdown();

        let counted = Arc::clone(&processed);
        let loop_shutdown = shutdown.clone();
        let loop_queue = Arc::clone(&queue);
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            run_consumer_loop(loop_queue, loop_shutdown, move |_job| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("consumer loop did not stop promptly after shutdown");

        assert_eq!(processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn producer_pump_forwards_every_job_to_the_queue() {
        let queue = Arc::new(InMemoryQueue::new());
        let (tx, rx) = mpsc::channel(4);
        let shutdown = ShutdownState::new();

        tx.send(sample_job()).await.unwrap();
        drop(tx);

        run_producer_pump(queue.clone(), rx, shutdown).await;

        assert!(queue.try_dequeue().is_some());
    }
}
