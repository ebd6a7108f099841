// src/worker.rs
//
// Bounded FIFO of readable connections plus the fixed set of worker threads
// draining it. A fd is enqueued only after the reactor saw readiness and
// dropped its one-shot interest, so a connection is owned by at most one
// worker at a time and never appears in the queue twice.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::conn::ReadOutcome;
use crate::http::Verdict;
use crate::server::Shared;
use crate::syscalls;

/// One unit of work: a readable connection, pinned to the generation the
/// reactor observed so a recycled fd is never processed against the slot's
/// next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub fd: RawFd,
    pub generation: u64,
}

pub struct WorkQueue {
    inner: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a readable fd. Fails when the queue is full; the reactor then
    /// re-arms read interest and the readiness re-signals on a later wakeup.
    pub fn append(&self, job: Job) -> bool {
        let mut q = self.inner.lock().expect("work queue poisoned");
        if q.shutdown || q.jobs.len() >= self.capacity {
            return false;
        }
        q.jobs.push_back(job);
        self.ready.notify_one();
        true
    }

    /// Block until a job arrives; `None` once the queue shuts down and drains.
    fn next_job(&self) -> Option<Job> {
        let mut q = self.inner.lock().expect("work queue poisoned");
        loop {
            if let Some(job) = q.jobs.pop_front() {
                return Some(job);
            }
            if q.shutdown {
                return None;
            }
            q = self.ready.wait(q).expect("work queue poisoned");
        }
    }

    pub fn close(&self) {
        let mut q = self.inner.lock().expect("work queue poisoned");
        q.shutdown = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("work queue poisoned").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<WorkQueue>,
        shared: Arc<Shared>,
    ) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("minnow-worker-{}", i))
                .spawn(move || worker_loop(i, &queue, &shared))?;
            handles.push(handle);
        }
        Ok(Self { queue, handles })
    }

    /// Stop accepting work, drain, and join every worker.
    pub fn shutdown(self) {
        self.queue.close();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, queue: &WorkQueue, shared: &Shared) {
    tracing::debug!(worker = id, "worker started");
    while let Some(job) = queue.next_job() {
        process_ready(shared, job);
    }
    tracing::debug!(worker = id, "worker exiting");
}

/// Drive one readable connection: drain the socket, advance the parser,
/// stage the response on a verdict, then hand interest back to the reactor.
fn process_ready(shared: &Shared, job: Job) {
    let fd = job.fd;
    let slot = match shared.table.slot(fd) {
        Some(slot) => slot,
        None => return,
    };
    let mut conn = slot.lock().expect("connection slot poisoned");
    if conn.fd != fd || conn.generation != job.generation {
        // Closed (and possibly reused) between enqueue and pop.
        return;
    }

    let verdict = match conn.read_from_socket() {
        ReadOutcome::Closed => Verdict::ClosedConnection,
        ReadOutcome::Failed => Verdict::ClosedConnection,
        ReadOutcome::NoData => {
            if shared
                .epoll
                .modify(fd, fd as u64, syscalls::read_interest())
                .is_err()
            {
                shared.close_connection(&mut conn);
            }
            return;
        }
        ReadOutcome::Data => conn.process_read(&shared.doc_root, &shared.creds),
    };

    match verdict {
        Verdict::NoRequest => {
            if shared
                .epoll
                .modify(fd, fd as u64, syscalls::read_interest())
                .is_err()
            {
                shared.close_connection(&mut conn);
            }
        }
        Verdict::ClosedConnection => {
            tracing::debug!(fd, "connection closed by peer");
            shared.close_connection(&mut conn);
        }
        verdict => {
            shared.metrics.inc_req();
            if let Some(peer) = conn.peer() {
                tracing::debug!(
                    fd,
                    %peer,
                    ?verdict,
                    host = conn.host_header().unwrap_or("-"),
                    path = %conn.target_path().display(),
                    "request processed"
                );
            }
            if conn.process_write(verdict) {
                if shared
                    .epoll
                    .modify(fd, fd as u64, syscalls::write_interest())
                    .is_err()
                {
                    shared.close_connection(&mut conn);
                }
            } else {
                tracing::warn!(fd, "response framing failed");
                shared.close_connection(&mut conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(fd: RawFd) -> Job {
        Job { fd, generation: 1 }
    }

    #[test]
    fn append_respects_capacity() {
        let queue = WorkQueue::new(2);
        assert!(queue.append(job(10)));
        assert!(queue.append(job(11)));
        assert!(!queue.append(job(12)), "third append must fail");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn jobs_come_out_in_fifo_order() {
        let queue = WorkQueue::new(8);
        queue.append(job(3));
        queue.append(job(1));
        queue.append(job(2));
        assert_eq!(queue.next_job(), Some(job(3)));
        assert_eq!(queue.next_job(), Some(job(1)));
        assert_eq!(queue.next_job(), Some(job(2)));
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let queue = Arc::new(WorkQueue::new(8));
        let q = Arc::clone(&queue);
        let waiter = thread::spawn(move || q.next_job());
        thread::sleep(std::time::Duration::from_millis(50));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(!queue.append(job(1)), "closed queue refuses work");
    }

    #[test]
    fn pending_jobs_drain_after_close() {
        let queue = WorkQueue::new(8);
        queue.append(job(7));
        queue.close();
        assert_eq!(queue.next_job(), Some(job(7)));
        assert_eq!(queue.next_job(), None);
    }
}
