//! Tool worker pool (§4.4): off-main-thread tool execution with
//! cancellation, idle reaping, and cold-start warm-up.
//!
//! Grounded in the teacher's `SessionLockMap`/`ApprovalStore` shape (a
//! `parking_lot::Mutex`-guarded queue plus a `Notify` to wake waiters), but
//! generalized into a real worker-pool: a bounded number of `tokio` tasks
//! (`[minWorkers, maxWorkers]`) pull jobs off a shared queue, reap
//! themselves after sitting idle past a threshold, and a fixed number are
//! pre-spawned at daemon start to remove first-call cold-start latency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sd_domain::agent::ToolExecutor;
use sd_domain::cancel::CancelToken;
use sd_domain::config::PoolConfig;
use sd_domain::error::{Error, Result};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// The one tool the daemon refuses to execute itself — the agent must
/// surface a permission request instead (§4.4 "Constraint").
pub const ASK_USER_TOOL: &str = "ask_user";

struct Job {
    id: String,
    name: String,
    args_json: serde_json::Value,
    cancel: CancelToken,
    respond: oneshot::Sender<Result<String>>,
}

pub struct WorkerPool {
    executor: Arc<dyn ToolExecutor>,
    min_workers: usize,
    max_workers: usize,
    idle_reap: Duration,
    queue: Arc<Mutex<VecDeque<Job>>>,
    notify: Arc<Notify>,
    worker_count: Arc<AtomicUsize>,
    busy_count: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn ToolExecutor>, config: &PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            executor,
            min_workers: config.min_workers,
            max_workers: config.effective_max_workers(),
            idle_reap: Duration::from_secs(config.idle_reap_secs),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            worker_count: Arc::new(AtomicUsize::new(0)),
            busy_count: Arc::new(AtomicUsize::new(0)),
        });
        let warmup = config.warmup_workers.min(pool.max_workers);
        for _ in 0..warmup {
            pool.clone().spawn_worker();
        }
        pool
    }

    pub fn busy(&self) -> usize {
        self.busy_count.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn maybe_spawn_worker(self: &Arc<Self>) {
        loop {
            let current = self.worker_count.load(Ordering::SeqCst);
            if current >= self.max_workers {
                return;
            }
            if self
                .worker_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.clone().run_worker();
                return;
            }
        }
    }

    fn spawn_worker(self: Arc<Self>) {
        self.worker_count.fetch_add(1, Ordering::SeqCst);
        self.run_worker();
    }

    fn run_worker(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let job = self.queue.lock().pop_front();
                match job {
                    Some(job) => {
                        self.busy_count.fetch_add(1, Ordering::SeqCst);
                        let Job { name, args_json, cancel, respond, .. } = job;
                        if cancel.is_cancelled() {
                            let _ = respond.send(Err(Error::Cancelled));
                            self.busy_count.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                        let result = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(Error::Cancelled),
                            r = self.executor.run_tool(&name, args_json, &cancel) => r,
                        };
                        self.busy_count.fetch_sub(1, Ordering::SeqCst);
                        let was_cancelled = matches!(result, Err(Error::Cancelled));
                        let _ = respond.send(result);
                        if was_cancelled {
                            // No portable synchronous interrupt exists for a
                            // blocking tool call (§4.4, §9): this worker is
                            // terminated rather than reused; a replacement
                            // slot is spawned lazily on next dispatch.
                            self.worker_count.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    }
                    None => {
                        let waited = tokio::time::timeout(self.idle_reap, self.notify.notified()).await;
                        if waited.is_err() && self.worker_count.load(Ordering::SeqCst) > self.min_workers {
                            self.worker_count.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Run one tool call. Rejects immediately with `Error::Cancelled` if
    /// `cancel` is already signalled before dispatch; otherwise enqueues the
    /// job and awaits completion (§4.4).
    pub async fn run_tool(
        self: &Arc<Self>,
        name: String,
        args_json: serde_json::Value,
        cancel: CancelToken,
    ) -> Result<String> {
        if name == ASK_USER_TOOL {
            return Err(Error::InvalidInput(
                "ask_user is not executable in the daemon; surface a permission request instead"
                    .into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let job_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.queue.lock().push_back(Job {
            id: job_id.clone(),
            name,
            args_json,
            cancel: cancel.clone(),
            respond: tx,
        });
        self.notify.notify_one();
        self.maybe_spawn_worker();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Drop the job if it's still queued (not yet dispatched).
                let mut q = self.queue.lock();
                if let Some(pos) = q.iter().position(|j| j.id == job_id) {
                    q.remove(pos);
                    return Err(Error::Cancelled);
                }
                drop(q);
                // Already dispatched: await the worker's own cancellation path.
                rx.await.unwrap_or(Err(Error::Cancelled))
            }
            r = rx => r.map_err(|_| Error::Other("tool worker terminated without a response".into()))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct EchoExecutor {
        calls: AtomicU64,
        delay_ms: u64,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn run_tool(&self, name: &str, args: serde_json::Value, _cancel: &CancelToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(format!("{name}:{args}"))
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            idle_reap_secs: 60,
            sweep_interval_secs: 30,
            warmup_workers: 0,
        }
    }

    #[tokio::test]
    async fn runs_tool_and_returns_result() {
        let exec = Arc::new(EchoExecutor { calls: AtomicU64::new(0), delay_ms: 0 });
        let pool = WorkerPool::new(exec, &config(1, 2));
        let out = pool.run_tool("read_file".into(), serde_json::json!({"path": "a"}), CancelToken::new()).await.unwrap();
        assert!(out.contains("read_file"));
    }

    #[tokio::test]
    async fn ask_user_is_rejected_without_dispatch() {
        let exec = Arc::new(EchoExecutor { calls: AtomicU64::new(0), delay_ms: 0 });
        let pool = WorkerPool::new(exec.clone(), &config(1, 2));
        let err = pool.run_tool(ASK_USER_TOOL.into(), serde_json::json!({}), CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_rejects_immediately() {
        let exec = Arc::new(EchoExecutor { calls: AtomicU64::new(0), delay_ms: 0 });
        let pool = WorkerPool::new(exec, &config(1, 2));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = pool.run_tool("read_file".into(), serde_json::json!({}), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn bounded_workers_drain_six_concurrent_jobs() {
        let exec = Arc::new(EchoExecutor { calls: AtomicU64::new(0), delay_ms: 20 });
        let pool = WorkerPool::new(exec, &config(1, 2));
        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.run_tool(format!("t{i}"), serde_json::json!({}), CancelToken::new()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(pool.worker_count() <= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.busy(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn queued_job_removed_on_cancel_before_dispatch() {
        // A single worker is kept busy with a slow job so the second job
        // stays queued long enough to be cancelled before dispatch.
        let exec = Arc::new(EchoExecutor { calls: AtomicU64::new(0), delay_ms: 200 });
        let pool = WorkerPool::new(exec.clone(), &config(1, 1));
        let pool2 = pool.clone();
        let _first = tokio::spawn(async move {
            let _ = pool2.run_tool("slow".into(), serde_json::json!({}), CancelToken::new()).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancelToken::new();
        let pool3 = pool.clone();
        let cancel2 = cancel.clone();
        let second = tokio::spawn(async move {
            pool3.run_tool("queued".into(), serde_json::json!({}), cancel2).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = second.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // The queued job never reached the executor.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }
}
