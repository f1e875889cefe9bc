// src/server.rs
//
// The reactor: one thread blocking on the readiness instance, accepting
// connections, draining reads (then handing the parse to the pool), and
// performing non-blocking writes inline. Connection descriptors are
// one-shot, so a connection is never touched by two threads at once.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, MAX_CONNECTIONS, MAX_EVENTS};
use crate::conn::ConnSlot;
use crate::error::PetrelResult;
use crate::pool::ThreadPool;
use crate::syscalls::{self, epoll_event, Epoll, READABLE};

/// Process-wide state owned by the reactor and handed to connections:
/// the readiness instance, the live-connection counter, and the document
/// root. Initialized once before the loop starts.
pub struct Shared {
    pub epoll: Epoll,
    pub live: AtomicUsize,
    pub doc_root: PathBuf,
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the event loop until `shutdown` is observed true. Setup
    /// failures (listener, epoll, pool) and wait errors other than EINTR
    /// are fatal and returned.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> PetrelResult<()> {
        let listen_fd = syscalls::create_listen_socket(&self.config.host, self.config.port)?;
        let shared = Arc::new(Shared {
            epoll: Epoll::new()?,
            live: AtomicUsize::new(0),
            doc_root: self.config.doc_root.clone(),
        });

        // fd-indexed table, sized once and never resized.
        let conns: Vec<Arc<ConnSlot>> = (0..MAX_CONNECTIONS)
            .map(|_| Arc::new(ConnSlot::new(Arc::clone(&shared))))
            .collect();

        let pool: ThreadPool<ConnSlot> =
            ThreadPool::new(self.config.workers, self.config.queue_depth)?;

        // The listener is edge-triggered but not one-shot.
        shared
            .epoll
            .register(listen_fd, listen_fd as u64, READABLE, false)?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            doc_root = %self.config.doc_root.display(),
            workers = self.config.workers,
            "petrel listening"
        );

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !shutdown.load(Ordering::Acquire) {
            let n = shared.epoll.wait(&mut events, -1)?;

            for ev in &events[..n] {
                let fd = ev.u64 as i32;
                if fd == listen_fd {
                    accept_ready(listen_fd, &shared, &conns);
                    continue;
                }

                let Some(slot) = conns.get(fd as usize) else {
                    continue;
                };
                let revents = ev.events as i32;

                if revents & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) != 0 {
                    let mut conn = slot.lock();
                    if conn.fd() == fd {
                        conn.close();
                    }
                } else if revents & libc::EPOLLIN != 0 {
                    let ok = {
                        let mut conn = slot.lock();
                        if conn.fd() != fd {
                            continue;
                        }
                        conn.on_readable()
                    };
                    if !ok {
                        slot.lock().close();
                    } else if !pool.submit(Arc::clone(slot)) {
                        warn!(fd, "task queue full, dropping connection");
                        slot.lock().close();
                    }
                } else if revents & libc::EPOLLOUT != 0 {
                    let mut conn = slot.lock();
                    if conn.fd() != fd {
                        continue;
                    }
                    if !conn.on_writable() {
                        conn.close();
                    }
                }
            }
        }

        info!("shutting down");
        pool.shutdown();
        unsafe { libc::close(listen_fd) };
        Ok(())
    }
}

/// Accept until the backlog is drained; the listener is edge-triggered so
/// a single accept per event could strand pending connections. Sockets
/// past capacity are accepted and immediately closed.
fn accept_ready(listen_fd: i32, shared: &Arc<Shared>, conns: &[Arc<ConnSlot>]) {
    loop {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some((fd, peer))) => {
                if fd as usize >= conns.len()
                    || shared.live.load(Ordering::Relaxed) >= MAX_CONNECTIONS
                {
                    warn!(%peer, "connection table full, rejecting");
                    unsafe { libc::close(fd) };
                    continue;
                }
                let mut conn = conns[fd as usize].lock();
                match conn.open(fd, peer) {
                    Ok(()) => debug!(fd, %peer, "accepted connection"),
                    Err(e) => warn!(%peer, error = %e, "failed to register connection"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}
