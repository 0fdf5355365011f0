//! Background worker pool.
//!
//! A fixed set of workers shared by all endpoints of a Nexus. Each endpoint
//! registers one MPMC input queue (preserving per-endpoint dispatch order)
//! and one op mailbox feeding completed work back into its polling loop.
//! Workers select across all registered endpoints, blocking with a timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender};

use crate::handler::{Continuation, MailboxOp, ReqHandle, ReqHandlerFn, RespHandle, RpcContext};

/// A unit of background work.
pub(crate) enum BgTask {
    /// Run a background-class request handler.
    Handler { handler: ReqHandlerFn, req: ReqHandle },
    /// Run the continuation of a request that was issued from background work.
    Continuation { cont: Continuation, resp: RespHandle, tag: u64 },
}

#[derive(Clone)]
struct EndpointQueues {
    id: u8,
    tasks: Receiver<BgTask>,
    mailbox: Sender<MailboxOp>,
}

struct PoolInner {
    endpoints: Mutex<Vec<EndpointQueues>>,
    /// Bumped on register/unregister so workers rebuild their select sets.
    generation: AtomicU64,
    shutdown: AtomicBool,
}

/// Fixed pool of background worker threads.
pub struct BackgroundPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl BackgroundPool {
    /// Spawn `num_threads` workers. Zero threads is valid; registering a
    /// background-class handler then becomes a configuration error upstream.
    pub(crate) fn new(num_threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            endpoints: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner = inner.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("pacerpc-bg-{i}"))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn background worker"),
            );
        }

        Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Number of worker threads.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub(crate) fn register_endpoint(
        &self,
        id: u8,
        tasks: Receiver<BgTask>,
        mailbox: Sender<MailboxOp>,
    ) {
        let mut endpoints = self.inner.endpoints.lock().unwrap();
        endpoints.push(EndpointQueues { id, tasks, mailbox });
        self.inner.generation.fetch_add(1, Ordering::Release);
    }

    /// Unregister an endpoint and cancel its queued work.
    pub(crate) fn unregister_endpoint(&self, id: u8) {
        let mut endpoints = self.inner.endpoints.lock().unwrap();
        if let Some(pos) = endpoints.iter().position(|e| e.id == id) {
            let queues = endpoints.remove(pos);
            self.inner.generation.fetch_add(1, Ordering::Release);
            drop(endpoints);

            let dropped = queues.tasks.try_iter().count();
            if dropped > 0 {
                tracing::debug!(
                    endpoint = id,
                    dropped,
                    "endpoint gone, cancelling queued background work"
                );
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(task: BgTask, mailbox: &Sender<MailboxOp>) {
    let ctx = RpcContext::background(mailbox);
    match task {
        BgTask::Handler { handler, req } => handler(&ctx, req),
        BgTask::Continuation { cont, resp, tag } => cont(&ctx, resp, tag),
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let gen = inner.generation.load(Ordering::Acquire);
        let queues: Vec<EndpointQueues> = inner.endpoints.lock().unwrap().clone();

        if queues.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let mut sel = Select::new();
        for q in &queues {
            sel.recv(&q.tasks);
        }

        // Serve this select set until the registration set changes.
        loop {
            if inner.shutdown.load(Ordering::Acquire)
                || inner.generation.load(Ordering::Acquire) != gen
            {
                break;
            }

            match sel.select_timeout(Duration::from_millis(10)) {
                Ok(oper) => {
                    let idx = oper.index();
                    match oper.recv(&queues[idx].tasks) {
                        Ok(task) => run_task(task, &queues[idx].mailbox),
                        // Sender side closed; force a rebuild.
                        Err(_) => break,
                    }
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MsgBuffer;
    use std::sync::atomic::AtomicUsize;

    fn test_req_handle() -> ReqHandle {
        ReqHandle {
            session_num: 0,
            slot_idx: 0,
            req_num: 0,
            req_type: 1,
            req_msgbuf: MsgBuffer::from_slice(b"ping").unwrap(),
            prealloc_resp: MsgBuffer::new(64).unwrap(),
            prealloc_idx: None,
            dyn_resp_msgbuf: None,
            prealloc_used: true,
        }
    }

    #[test]
    fn test_pool_runs_handler_in_background() {
        let pool = BackgroundPool::new(2);
        let (task_tx, task_rx) = crossbeam_channel::bounded(16);
        let (mb_tx, mb_rx) = crossbeam_channel::unbounded();
        pool.register_endpoint(0, task_rx, mb_tx);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handler: ReqHandlerFn = Arc::new(move |ctx, req| {
            assert!(ctx.in_background());
            ran2.fetch_add(1, Ordering::SeqCst);
            // Deposit the response so it flows back through the mailbox.
            let _ = ctx.enqueue_response(req);
        });

        task_tx
            .send(BgTask::Handler { handler, req: test_req_handle() })
            .unwrap();

        let op = mb_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("mailbox op not deposited");
        assert!(matches!(op, MailboxOp::EnqueueResponse(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        pool.unregister_endpoint(0);
        pool.shutdown();
    }

    #[test]
    fn test_pool_unregister_cancels_queued_work() {
        let pool = BackgroundPool::new(0);
        let (task_tx, task_rx) = crossbeam_channel::bounded(16);
        let (mb_tx, _mb_rx) = crossbeam_channel::unbounded();
        pool.register_endpoint(3, task_rx, mb_tx);

        // No workers, so the task stays queued until the endpoint goes away.
        let handler: ReqHandlerFn = Arc::new(|_, _| panic!("cancelled work must not run"));
        task_tx
            .send(BgTask::Handler { handler, req: test_req_handle() })
            .unwrap();

        pool.unregister_endpoint(3);
        pool.shutdown();
    }
}
