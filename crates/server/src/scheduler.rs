use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gateway_protocol::GatewayError;
use tokio::sync::{Mutex, RwLock, oneshot};

type BoxedJob = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

struct QueuedJob {
    job: BoxedJob,
    done: oneshot::Sender<Result<(), GatewayError>>,
}

/// Per-agent token bucket: `tokens`, `last_refill`, and a FIFO queue of
/// pending jobs. `processing` guards re-entrancy of the consumer loop.
struct Bucket {
    tokens: f64,
    last_refill: tokio::time::Instant,
    queue: std::collections::VecDeque<QueuedJob>,
    processing: bool,
}

/// Per-agent token-bucket FIFO scheduler (spec.md §4.2). All outbound chat
/// network operations for a given agent pass through `enqueue`, which
/// preserves submission order and rejects once the agent's queue is full.
pub struct Scheduler {
    tokens_per_minute: f64,
    burst: f64,
    queue_limit: usize,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl Scheduler {
    pub fn new(tokens_per_minute: f64, burst: f64, queue_limit: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            tokens_per_minute,
            burst,
            queue_limit,
            buckets: RwLock::new(HashMap::new()),
        });

        let refill_scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                refill_scheduler.refill().await;
            }
        });

        scheduler
    }

    async fn bucket_for(&self, agent_id: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().await.get(agent_id) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().await;
        Arc::clone(buckets.entry(agent_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: self.burst,
                last_refill: tokio::time::Instant::now(),
                queue: std::collections::VecDeque::new(),
                processing: false,
            }))
        }))
    }

    /// Enqueue `job` for `agent_id` and await its result. Fails
    /// `RATE_LIMITED` if the agent's queue is already at `queue_limit`.
    pub async fn enqueue<F>(self: &Arc<Self>, agent_id: &str, job: F) -> Result<(), GatewayError>
    where
        F: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let bucket = self.bucket_for(agent_id).await;
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = bucket.lock().await;
            if guard.queue.len() >= self.queue_limit {
                return Err(GatewayError::rate_limited(format!(
                    "queue for agent is saturated at {}",
                    self.queue_limit
                )));
            }
            guard.queue.push_back(QueuedJob {
                job: Box::pin(job),
                done: tx,
            });
        }

        self.process(agent_id, &bucket).await;

        rx.await
            .unwrap_or_else(|_| Err(GatewayError::rate_limited("scheduler dropped the job")))
    }

    /// Pull FIFO while tokens are available. Guarded by `processing` so
    /// concurrent callers don't race the same agent's consumer loop.
    async fn process(&self, _agent_id: &str, bucket: &Arc<Mutex<Bucket>>) {
        {
            let mut guard = bucket.lock().await;
            if guard.processing {
                return;
            }
            guard.processing = true;
        }

        loop {
            let job = {
                let mut guard = bucket.lock().await;
                if guard.tokens < 1.0 || guard.queue.is_empty() {
                    guard.processing = false;
                    return;
                }
                guard.tokens -= 1.0;
                guard.queue.pop_front()
            };

            let Some(queued) = job else {
                let mut guard = bucket.lock().await;
                guard.processing = false;
                return;
            };

            let result = queued.job.await;
            let _ = queued.done.send(result);
            tokio::task::yield_now().await;
        }
    }

    /// Runs once per second: refills every agent's bucket proportionally to
    /// elapsed time, clamped to `burst`, and wakes the consumer if the queue
    /// is non-empty.
    async fn refill(&self) {
        let buckets: Vec<Arc<Mutex<Bucket>>> = self.buckets.read().await.values().cloned().collect();

        for bucket in buckets {
            let should_poke = {
                let mut guard = bucket.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed_minutes = now.duration_since(guard.last_refill).as_secs_f64() / 60.0;
                if elapsed_minutes * self.tokens_per_minute >= 1.0 {
                    guard.tokens = (guard.tokens + elapsed_minutes * self.tokens_per_minute).min(self.burst);
                    guard.last_refill = now;
                }
                !guard.queue.is_empty()
            };

            if should_poke {
                self.process("", &bucket).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_run_in_fifo_order_per_agent() {
        let scheduler = Scheduler::new(100.0, 100.0, 500);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue("agent-1", async move {
                        order.lock().await.push(i);
                        Ok(())
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn queue_saturation_rejects_with_rate_limited() {
        let scheduler = Scheduler::new(0.0001, 1.0, 2);

        // Consume the single burst token with a job that never resolves so
        // the queue stays full behind it.
        let (_never_tx, never_rx) = oneshot::channel::<()>();
        let scheduler_for_block = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let _ = scheduler_for_block
                .enqueue("agent-2", async move {
                    let _ = never_rx.await;
                    Ok(())
                })
                .await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let scheduler_a = Arc::clone(&scheduler);
        let scheduler_b = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let _ = scheduler_a.enqueue("agent-2", async { Ok(()) }).await;
        });
        tokio::spawn(async move {
            let _ = scheduler_b.enqueue("agent-2", async { Ok(()) }).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let result = scheduler.enqueue("agent-2", async { Ok(()) }).await;
        assert!(matches!(result, Err(e) if e.code == gateway_protocol::ErrorCode::RateLimited));
    }

    #[tokio::test]
    async fn each_successful_job_consumes_exactly_one_token() {
        let scheduler = Scheduler::new(100.0, 1.0, 500);

        let first = scheduler.enqueue("agent-3", async { Ok(()) }).await;
        assert!(first.is_ok());

        // The burst of 1 token is exhausted; with an effectively-zero refill
        // rate the next job should queue rather than run immediately, but it
        // must still eventually complete once time is advanced. We only
        // assert it doesn't error synchronously with a full queue.
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            scheduler.enqueue("agent-3", async { Ok(()) }),
        )
        .await;
        // Either it completed after a refill tick, or it's still pending —
        // both are acceptable; what must NOT happen is a rate-limit error.
        if let Ok(result) = second {
            assert!(result.is_ok());
        }
    }
}
