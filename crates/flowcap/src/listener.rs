//! A listener whose accepted connections share a bandwidth budget.

use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::alloc::Allocator;
use crate::bucket::TokenBucket;
use crate::conn::Throttled;
use crate::err::Error;
use crate::net::{NetListener, TcpListener};
use crate::Result;

/// How often the background sweeper prunes dead registrations.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Bind a TCP listener on `addr` whose accepted connections are limited to
/// `conn_limit` bytes per second each and `global_limit` bytes per second
/// in aggregate.
pub async fn listen<A: tokio::net::ToSocketAddrs>(
    addr: A,
    global_limit: u64,
    conn_limit: u64,
) -> Result<ThrottledListener<TcpListener>> {
    let inner = TcpListener::bind(addr).await?;
    ThrottledListener::new(inner, global_limit, conn_limit)
}

/// A listener wrapper that throttles every accepted connection.
///
/// Connections share one global [`TokenBucket`] and each get their own
/// [`Allocator`]. The listener keeps only weak registrations: dropping an
/// accepted stream drops its allocator, and a background sweeper prunes the
/// registration on its next pass. Dropping the listener closes the
/// underlying socket and, through the weak registry, stops the sweeper.
pub struct ThrottledListener<L> {
    /// The wrapped transport listener.
    inner: L,
    /// The bucket shared by every accepted connection.
    global: Arc<TokenBucket>,
    /// Live connections and the limits currently in force.
    registry: Arc<Mutex<Registry>>,
}

/// Listener state shared with the sweeper.
struct Registry {
    /// One registration per accepted connection still believed live.
    conns: Vec<Weak<Allocator>>,
    /// The aggregate limit in bytes per second.
    limit_global: u64,
    /// The per-connection limit applied to future accepts.
    limit_conn: u64,
}

impl<L: NetListener> ThrottledListener<L> {
    /// Wrap `inner` with the given limits in bytes per second.
    ///
    /// Fails with [`Error::LocalOverGlobal`] if `conn_limit` exceeds
    /// `global_limit`. Must be called from within a tokio runtime; the
    /// sweeper task is spawned here.
    pub fn new(inner: L, global_limit: u64, conn_limit: u64) -> Result<Self> {
        if conn_limit > global_limit {
            return Err(Error::LocalOverGlobal {
                requested: conn_limit,
                global: global_limit,
            });
        }
        let registry = Arc::new(Mutex::new(Registry {
            conns: Vec::new(),
            limit_global: global_limit,
            limit_conn: conn_limit,
        }));
        spawn_sweeper(&registry);
        Ok(ThrottledListener {
            inner,
            global: Arc::new(TokenBucket::new(global_limit as f64, global_limit)),
            registry,
        })
    }

    /// Wait for the next connection, wrapped to obey the listener's limits.
    pub async fn accept(&self) -> Result<(Throttled<L::Stream>, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let alloc = {
            let mut registry = self.registry.lock().expect("poisoned lock");
            let alloc = Arc::new(Allocator::new(Arc::clone(&self.global), registry.limit_conn));
            registry.conns.push(Arc::downgrade(&alloc));
            alloc
        };
        debug!(%addr, limit = alloc.limit(), "accepted throttled connection");
        Ok((Throttled::new(stream, alloc), addr))
    }

    /// Change the aggregate limit shared by all connections.
    ///
    /// Per-connection limits are not touched.
    pub fn set_global_limit(&self, limit: u64) {
        let mut registry = self.registry.lock().expect("poisoned lock");
        self.global.set_rate(limit as f64);
        self.global.set_burst(limit);
        registry.limit_global = limit;
        debug!(limit, "global limit changed");
    }

    /// Change the per-connection limit, for every live connection and for
    /// all future accepts.
    ///
    /// Fails with [`Error::LocalOverGlobal`] if `limit` exceeds the current
    /// global limit. If a live connection refuses the new limit, the first
    /// such error is returned and the stored default is left unchanged.
    pub fn set_local_limit(&self, limit: u64) -> Result<()> {
        let mut registry = self.registry.lock().expect("poisoned lock");
        if limit > registry.limit_global {
            return Err(Error::LocalOverGlobal {
                requested: limit,
                global: registry.limit_global,
            });
        }
        let mut first_err = None;
        for alloc in registry.conns.iter().filter_map(Weak::upgrade) {
            if let Err(e) = alloc.set_limit(limit) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        registry.limit_conn = limit;
        Ok(())
    }

    /// The aggregate limit currently in force, in bytes per second.
    pub fn global_limit(&self) -> u64 {
        self.registry.lock().expect("poisoned lock").limit_global
    }

    /// The per-connection limit applied to future accepts.
    pub fn conn_limit(&self) -> u64 {
        self.registry.lock().expect("poisoned lock").limit_conn
    }

    /// How many accepted connections are still registered and open.
    ///
    /// Closed connections may be counted until the sweeper's next pass.
    pub fn active_connections(&self) -> usize {
        self.registry
            .lock()
            .expect("poisoned lock")
            .conns
            .iter()
            .filter(|conn| conn.upgrade().is_some_and(|a| !a.is_closed()))
            .count()
    }

    /// The local address of the wrapped listener.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Prune dead or closed registrations once per [`SWEEP_PERIOD`].
///
/// The task holds only a weak reference to the registry, so it exits on its
/// first pass after the listener is dropped.
fn spawn_sweeper(registry: &Arc<Mutex<Registry>>) {
    let registry = Arc::downgrade(registry);
    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let mut registry = registry.lock().expect("poisoned lock");
            let before = registry.conns.len();
            registry
                .conns
                .retain(|conn| conn.upgrade().is_some_and(|a| !a.is_closed()));
            let swept = before - registry.conns.len();
            if swept > 0 {
                trace!(swept, "pruned closed connections");
            }
        }
    });
    drop(task); // this makes the task detached.
}
