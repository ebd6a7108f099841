// src/server.rs
//
// The reactor: one thread owning the listen socket, the epoll instance, the
// signal self-pipe and the idle-timer list. Readable clients are handed to
// the worker pool; writable clients are drained here with vectored sends;
// signal bytes and timer ticks are processed at batch boundaries.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::{HttpConn, WriteOutcome};
use crate::creds::CredStore;
use crate::error::{ServerError, ServerResult};
use crate::metrics::Metrics;
use crate::syscalls::{self, Epoll};
use crate::table::ConnTable;
use crate::timer::{TimerKey, TimerList};
use crate::worker::{Job, WorkQueue, WorkerPool};

/// Upper bound on events drained per wakeup.
const MAX_EVENT_NUMBER: usize = 10_000;

/// State shared between the reactor and the workers.
pub struct Shared {
    pub epoll: Epoll,
    pub table: ConnTable,
    pub metrics: Metrics,
    pub creds: CredStore,
    pub doc_root: PathBuf,
}

impl Shared {
    /// Tear down a live connection: drop epoll interest, close the socket,
    /// clear the slot, decrement the user count. Idempotent.
    pub(crate) fn close_connection(&self, conn: &mut HttpConn) {
        if !conn.is_live() {
            return;
        }
        let fd = conn.fd;
        let _ = self.epoll.delete(fd);
        syscalls::close_fd(fd);
        conn.release();
        self.metrics.dec_conn();
    }
}

/// Writes the SIGTERM byte into the self-pipe, asking the reactor to stop
/// after the current batch. Same path a real SIGTERM takes.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownHandle {
    pipe_write: RawFd,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        syscalls::send_signal_byte(self.pipe_write, libc::SIGTERM);
    }
}

pub struct Server {
    cfg: Config,
    listen_fd: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    queue: Arc<WorkQueue>,
    timers: TimerList,
}

impl Server {
    /// Bind the listen socket, build the connection table and wire up the
    /// signal pipe. The reactor does not run until [`Server::run`].
    pub fn new(cfg: Config) -> ServerResult<Server> {
        let creds = match &cfg.credentials_file {
            Some(path) => CredStore::load(path)?,
            None => CredStore::new(),
        };

        let listen_fd = syscalls::create_listen_socket(&cfg.host, cfg.port)
            .map_err(|e| ServerError::Addr(format!("{}: {}", cfg.server_addr(), e)))?;
        let local_addr = syscalls::local_addr(listen_fd)?;

        let epoll = Epoll::new()?;
        epoll.add(listen_fd, listen_fd as u64, libc::EPOLLIN as u32)?;

        let (pipe_read, pipe_write) = syscalls::signal_pipe()?;
        epoll.add(pipe_read, pipe_read as u64, libc::EPOLLIN as u32)?;
        syscalls::install_signal_handlers(pipe_write)?;

        let shared = Arc::new(Shared {
            epoll,
            table: ConnTable::new(cfg.max_fd),
            metrics: Metrics::new(),
            creds,
            doc_root: cfg.doc_root.clone(),
        });

        Ok(Server {
            queue: Arc::new(WorkQueue::new(cfg.queue_capacity)),
            timers: TimerList::new(),
            listen_fd,
            pipe_read,
            pipe_write,
            local_addr,
            shared,
            cfg,
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            pipe_write: self.pipe_write,
        }
    }

    /// The credential store, for seeding before the server runs.
    pub fn credentials(&self) -> &CredStore {
        &self.shared.creds
    }

    /// Reactor-shared state; exposes the metrics counters to embedders.
    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Run the reactor until SIGTERM (or a shutdown handle) stops it.
    pub fn run(mut self) -> ServerResult<()> {
        let pool = WorkerPool::spawn(
            self.cfg.worker_count(),
            Arc::clone(&self.queue),
            Arc::clone(&self.shared),
        )?;
        syscalls::arm_alarm(self.cfg.timeslot_secs as u32);
        info!(
            addr = %self.local_addr,
            workers = self.cfg.worker_count(),
            doc_root = %self.cfg.doc_root.display(),
            "listening"
        );

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        // The alarm is the primary tick source; the bounded wait keeps ticks
        // alive even if something else in the process re-arms the alarm.
        let timeout_ms = (self.cfg.timeslot_secs.max(1) * 1000) as i32;
        let mut last_tick = Instant::now();
        let mut stop = false;
        let mut fatal: Option<ServerError> = None;

        while !stop {
            let n = match self.shared.epoll.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    fatal = Some(e.into());
                    break;
                }
            };

            let mut tick_pending = false;
            for i in 0..n {
                let token = events[i].u64 as RawFd;
                let evs = events[i].events;

                if token == self.listen_fd {
                    self.accept_clients();
                } else if token == self.pipe_read {
                    self.drain_signal_pipe(&mut tick_pending, &mut stop);
                } else if evs & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                    debug!(fd = token, "hangup or error on client socket");
                    self.evict(token);
                } else if evs & libc::EPOLLIN as u32 != 0 {
                    self.dispatch_readable(token);
                } else if evs & libc::EPOLLOUT as u32 != 0 {
                    self.handle_writable(token);
                }
            }

            if last_tick.elapsed() >= self.cfg.timeslot() {
                tick_pending = true;
            }
            if tick_pending {
                self.expire_idle();
                last_tick = Instant::now();
            }
        }

        self.teardown(pool);
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::Interrupted {
                        warn!(error = %e, "accept failed");
                    }
                    break;
                }
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: SocketAddr) {
        let over_limit = self.shared.metrics.active_conns() >= self.cfg.max_connections;
        let slot = match self.shared.table.slot(fd) {
            Some(slot) if !over_limit => slot,
            _ => {
                warn!(fd, %peer, "refusing connection: server busy");
                let _ = syscalls::write(fd, b"Internal server busy");
                syscalls::close_fd(fd);
                return;
            }
        };

        let generation = slot.lock().expect("connection slot poisoned").init(fd, peer);
        self.shared.metrics.inc_conn();

        if let Err(e) = self
            .shared
            .epoll
            .add(fd, fd as u64, syscalls::read_interest())
        {
            warn!(fd, error = %e, "failed to register client socket");
            let mut conn = slot.lock().expect("connection slot poisoned");
            self.shared.close_connection(&mut conn);
            return;
        }

        let expire = Instant::now() + self.cfg.idle_timeout();
        let handle = self.timers.add(expire, TimerKey { fd, generation });
        slot.lock().expect("connection slot poisoned").timer = Some(handle);
        debug!(fd, %peer, "accepted connection");
    }

    fn drain_signal_pipe(&mut self, tick_pending: &mut bool, stop: &mut bool) {
        let mut buf = [0u8; 1024];
        loop {
            match syscalls::read(self.pipe_read, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        let sig = byte as i32;
                        if sig == libc::SIGALRM {
                            *tick_pending = true;
                        } else if sig == libc::SIGTERM {
                            info!("SIGTERM received, shutting down");
                            *stop = true;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// A client became readable: hand it to the pool and push its idle
    /// deadline out. On a full queue, re-arm and let readiness re-signal.
    fn dispatch_readable(&mut self, fd: RawFd) {
        let slot = match self.shared.table.slot(fd) {
            Some(slot) => slot,
            None => return,
        };
        let (handle, generation) = {
            let conn = slot.lock().expect("connection slot poisoned");
            if conn.fd != fd {
                return;
            }
            (conn.timer, conn.generation)
        };

        if self.queue.append(Job { fd, generation }) {
            if let Some(handle) = handle {
                self.timers
                    .adjust(handle, Instant::now() + self.cfg.idle_timeout());
            }
        } else {
            debug!(fd, "work queue full, deferring");
            if self
                .shared
                .epoll
                .modify(fd, fd as u64, syscalls::read_interest())
                .is_err()
            {
                self.evict(fd);
            }
        }
    }

    /// A client became writable: run the vectored-send loop. Completion
    /// either resets for the next keep-alive request or closes; errors
    /// always close and always drop the timer.
    fn handle_writable(&mut self, fd: RawFd) {
        let slot = match self.shared.table.slot(fd) {
            Some(slot) => slot,
            None => return,
        };
        let mut conn = slot.lock().expect("connection slot poisoned");
        if conn.fd != fd {
            return;
        }

        match conn.flush() {
            WriteOutcome::Partial { sent } => {
                self.shared.metrics.add_bytes(sent);
                let handle = conn.timer;
                if self
                    .shared
                    .epoll
                    .modify(fd, fd as u64, syscalls::write_interest())
                    .is_err()
                {
                    close_with_timer(&self.shared, &mut self.timers, &mut conn);
                    return;
                }
                if let Some(handle) = handle {
                    self.timers
                        .adjust(handle, Instant::now() + self.cfg.idle_timeout());
                }
            }
            WriteOutcome::Complete { keep_alive: true, sent } => {
                self.shared.metrics.add_bytes(sent);
                conn.reset_for_next_request();
                let handle = conn.timer;
                if self
                    .shared
                    .epoll
                    .modify(fd, fd as u64, syscalls::read_interest())
                    .is_err()
                {
                    close_with_timer(&self.shared, &mut self.timers, &mut conn);
                    return;
                }
                if let Some(handle) = handle {
                    self.timers
                        .adjust(handle, Instant::now() + self.cfg.idle_timeout());
                }
                debug!(fd, "response complete, connection kept alive");
            }
            WriteOutcome::Complete { keep_alive: false, sent } => {
                self.shared.metrics.add_bytes(sent);
                debug!(fd, "response complete, closing");
                close_with_timer(&self.shared, &mut self.timers, &mut conn);
            }
            WriteOutcome::Error { sent } => {
                self.shared.metrics.add_bytes(sent);
                debug!(fd, "write error, closing");
                close_with_timer(&self.shared, &mut self.timers, &mut conn);
            }
        }
    }

    /// Close a connection from the reactor side (hangup, error, deferred
    /// enqueue failure), removing its timer.
    fn evict(&mut self, fd: RawFd) {
        let slot = match self.shared.table.slot(fd) {
            Some(slot) => slot,
            None => return,
        };
        let mut conn = slot.lock().expect("connection slot poisoned");
        if conn.fd != fd {
            return;
        }
        close_with_timer(&self.shared, &mut self.timers, &mut conn);
    }

    /// Fire expired idle timers. Keys whose connection already closed (or
    /// whose fd was reused by a newer connection) are skipped.
    fn expire_idle(&mut self) {
        let now = Instant::now();
        for key in self.timers.tick(now) {
            let slot = match self.shared.table.slot(key.fd) {
                Some(slot) => slot,
                None => continue,
            };
            let mut conn = slot.lock().expect("connection slot poisoned");
            if conn.fd != key.fd || conn.generation != key.generation {
                continue;
            }
            conn.timer = None;
            debug!(fd = key.fd, "closing idle connection");
            self.shared.close_connection(&mut conn);
        }
        syscalls::arm_alarm(self.cfg.timeslot_secs as u32);
    }

    fn teardown(&mut self, pool: WorkerPool) {
        pool.shutdown();

        for fd in 0..self.shared.table.capacity() as RawFd {
            if let Some(slot) = self.shared.table.slot(fd) {
                let mut conn = slot.lock().expect("connection slot poisoned");
                if conn.is_live() {
                    close_with_timer(&self.shared, &mut self.timers, &mut conn);
                }
            }
        }

        // Quiesce the signal path before its fd can be recycled.
        syscalls::clear_signal_fd(self.pipe_write);
        syscalls::arm_alarm(0);

        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.pipe_read);
        syscalls::close_fd(self.pipe_write);
        info!("server shut down");
    }
}

fn close_with_timer(shared: &Shared, timers: &mut TimerList, conn: &mut HttpConn) {
    let handle = conn.timer.take();
    shared.close_connection(conn);
    if let Some(handle) = handle {
        timers.remove(handle);
    }
}
