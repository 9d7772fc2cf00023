//! The per-connection bandwidth allocator.
//!
//! One [`Allocator`] exists per accepted connection. It owns the
//! connection's local token bucket and shares the listener-wide global
//! bucket; every read and write asks it for a grant before touching the
//! transport. A grant is charged to both buckets, and the caller is blocked
//! until both have actually accrued the tokens.
//!
//! The local limit can change while a grant is being waited for. When that
//! happens, the in-flight attempt cancels its global reservation (refunding
//! the tokens that had not yet accrued) and silently retries under the new
//! limit; the caller never observes the preemption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use event_listener::Event;
use tracing::{debug, trace};

use crate::bucket::TokenBucket;
use crate::err::Error;
use crate::Result;

/// Outcome of a single allocation attempt that did not produce a grant.
enum Preempted {
    /// The local limit changed while the attempt was in flight. The outer
    /// loop retries under the new limit; this is never surfaced.
    LimitChanged,
    /// A terminal error to hand to the caller.
    Fatal(Error),
}

/// Brokers bandwidth for one connection against a local and a shared
/// ceiling.
///
/// All methods take `&self`; the allocator is internally synchronized and
/// normally lives behind an `Arc` shared by the connection adapter and the
/// listener's registry.
#[derive(Debug)]
pub struct Allocator {
    /// The listener-wide bucket, shared by every connection.
    global: Arc<TokenBucket>,
    /// This connection's own bucket. Rate and burst both equal the local
    /// limit.
    local: TokenBucket,
    /// The local limit in bytes per second. The mutex serializes
    /// [`set_limit`](Allocator::set_limit) callers.
    limit: Mutex<u64>,
    /// Bumped on every limit change. Successive changes coalesce: an
    /// in-flight attempt only needs to see that the count moved since its
    /// snapshot, not how often or to what.
    update_version: AtomicU64,
    /// Wakes attempts parked on the update edge.
    updates: Event,
    /// Latched once closed, so closing is idempotent.
    closed: AtomicBool,
    /// Wakes attempts parked on the terminal edge.
    done: Event,
}

impl Allocator {
    /// Create an allocator with the given shared bucket and local limit in
    /// bytes per second.
    pub fn new(global: Arc<TokenBucket>, limit: u64) -> Self {
        Allocator {
            local: TokenBucket::new(limit as f64, limit),
            global,
            limit: Mutex::new(limit),
            update_version: AtomicU64::new(0),
            updates: Event::new(),
            closed: AtomicBool::new(false),
            done: Event::new(),
        }
    }

    /// Obtain a grant of up to `n` bytes.
    ///
    /// Blocks until the granted amount has been charged to both the local
    /// and the shared bucket and both have accrued it, then returns the
    /// grant `g`, with `1 <= g <= min(n, local limit)`.
    ///
    /// Limit changes that land mid-wait are absorbed by an internal retry;
    /// the grant returned always respects the limit in force when it is
    /// produced. Cancel-safe: dropping the future refunds any tokens that
    /// had not yet accrued.
    pub async fn allocate(&self, n: u64) -> Result<u64> {
        loop {
            match self.try_allocate(n).await {
                Ok(granted) => {
                    trace!(granted, requested = n, "bandwidth granted");
                    return Ok(granted);
                }
                Err(Preempted::LimitChanged) => {
                    trace!(requested = n, "allocation preempted by limit change, retrying");
                }
                Err(Preempted::Fatal(e)) => return Err(e),
            }
        }
    }

    /// A single allocation attempt under one snapshot of the local limit.
    async fn try_allocate(&self, n: u64) -> std::result::Result<u64, Preempted> {
        if self.is_closed() {
            return Err(Preempted::Fatal(Error::Closed));
        }
        let version = self.update_version.load(Ordering::SeqCst);
        let limit = *self.limit.lock().expect("poisoned lock");
        let quota = n.min(limit);
        if quota == 0 {
            return Err(Preempted::Fatal(Error::ZeroLimit));
        }

        // Charge the shared bucket first. The reservation is a drop guard:
        // every early return below refunds its unaccrued portion.
        let reservation = match self.global.reserve(quota) {
            Some(r) => r,
            None => {
                return Err(Preempted::Fatal(Error::GlobalReservation {
                    requested: quota,
                    burst: self.global.burst(),
                }));
            }
        };

        // Wait for the local bucket, unless an edge preempts us. A refused
        // local wait means the limit shrank under us, which counts as a
        // change edge too.
        tokio::select! {
            biased;
            () = self.closed_edge() => return Err(Preempted::Fatal(Error::Closed)),
            () = self.update_edge(version) => return Err(Preempted::LimitChanged),
            waited = self.local.wait(quota) => {
                if waited.is_err() {
                    return Err(Preempted::LimitChanged);
                }
            }
        }

        // The local wait may have completed concurrently with a limit
        // change; this recheck closes that window.
        if self.update_version.load(Ordering::SeqCst) != version {
            return Err(Preempted::LimitChanged);
        }

        // Both buckets are charged; now wait out the shared bucket's
        // schedule, still yielding to the edges.
        let ready_at = reservation.ready_at();
        tokio::select! {
            biased;
            () = self.closed_edge() => return Err(Preempted::Fatal(Error::Closed)),
            () = self.update_edge(version) => return Err(Preempted::LimitChanged),
            () = tokio::time::sleep_until(ready_at) => {}
        }

        reservation.commit();
        Ok(quota)
    }

    /// Change the local limit to `new_limit` bytes per second.
    ///
    /// Fails with [`Error::LocalOverGlobal`] if `new_limit` exceeds the
    /// shared bucket's capacity. On success the local bucket is retuned and
    /// drained of its credit, so the new limit starts from zero rather than
    /// with a burst's worth of instant headroom, and one coalesced update
    /// edge is published to in-flight allocations.
    pub fn set_limit(&self, new_limit: u64) -> Result<()> {
        let total = self.global.burst();
        if new_limit > total {
            return Err(Error::LocalOverGlobal {
                requested: new_limit,
                global: total,
            });
        }
        {
            let mut limit = self.limit.lock().expect("poisoned lock");
            *limit = new_limit;
            self.local.set_rate(new_limit as f64);
            self.local.set_burst(new_limit);
            self.local.drain(new_limit);
            self.update_version.fetch_add(1, Ordering::SeqCst);
        }
        self.updates.notify(usize::MAX);
        debug!(limit = new_limit, "local limit changed");
        Ok(())
    }

    /// The local limit currently in force, in bytes per second.
    pub fn limit(&self) -> u64 {
        *self.limit.lock().expect("poisoned lock")
    }

    /// Close the allocator. Idempotent; every pending and future
    /// [`allocate`](Allocator::allocate) fails with [`Error::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.done.notify(usize::MAX);
            debug!("allocator closed");
        }
    }

    /// Whether [`close`](Allocator::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Completes once the update counter moves past `since`.
    async fn update_edge(&self, since: u64) {
        loop {
            if self.update_version.load(Ordering::SeqCst) != since {
                return;
            }
            let listener = self.updates.listen();
            // Recheck after arming the listener, or a notification landing
            // in between would be lost.
            if self.update_version.load(Ordering::SeqCst) != since {
                return;
            }
            listener.await;
        }
    }

    /// Completes once the allocator is closed.
    async fn closed_edge(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let listener = self.done.listen();
            if self.is_closed() {
                return;
            }
            listener.await;
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    use std::time::Duration;
    use tokio::time::Instant;

    fn shared(rate: u64) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new(rate as f64, rate))
    }

    #[tokio::test(start_paused = true)]
    async fn grant_is_clamped_to_local_limit() {
        let alloc = Allocator::new(shared(100), 10);
        assert_eq!(alloc.allocate(1000).await.unwrap(), 10);
        assert_eq!(alloc.allocate(3).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_fails_fast() {
        let alloc = Allocator::new(shared(100), 0);
        let start = Instant::now();
        assert!(matches!(alloc.allocate(10).await, Err(Error::ZeroLimit)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn local_limit_over_global_burst_is_fatal() {
        // Can only happen when the invariant is bypassed by constructing
        // the allocator directly; allocate must refuse rather than hang.
        let alloc = Allocator::new(shared(10), 20);
        assert!(matches!(
            alloc.allocate(20).await,
            Err(Error::GlobalReservation {
                requested: 20,
                burst: 10
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_allocator_is_terminal() {
        let alloc = Allocator::new(shared(100), 10);
        alloc.close();
        alloc.close(); // must stay idempotent
        let start = Instant::now();
        assert!(matches!(alloc.allocate(1).await, Err(Error::Closed)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn close_unblocks_a_waiting_allocation() {
        let alloc = Arc::new(Allocator::new(shared(100), 10));
        // Drain the burst so the next allocation has to wait.
        alloc.allocate(10).await.unwrap();

        let start = Instant::now();
        let pending = tokio::spawn({
            let alloc = Arc::clone(&alloc);
            async move { alloc.allocate(10).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        alloc.close();

        assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_change_is_invisible_to_the_caller() {
        let alloc = Arc::new(Allocator::new(shared(100), 1));
        // Use up the burst so the next allocation blocks in the local wait.
        alloc.allocate(1).await.unwrap();

        let start = Instant::now();
        let pending = tokio::spawn({
            let alloc = Arc::clone(&alloc);
            async move { alloc.allocate(5).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        alloc.set_limit(5).unwrap();

        // The blocked call retries under the new limit and returns a grant
        // bounded by it, without surfacing the preemption.
        let granted = pending.await.unwrap().unwrap();
        assert_eq!(granted, 5);
        assert!(start.elapsed() <= Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn raising_limit_over_global_is_rejected() {
        let alloc = Allocator::new(shared(10), 5);
        assert!(matches!(
            alloc.set_limit(20),
            Err(Error::LocalOverGlobal {
                requested: 20,
                global: 10
            })
        ));
        // The rejected call changed nothing.
        assert_eq!(alloc.limit(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn connections_contend_on_the_shared_bucket() {
        let global = shared(10);
        let first = Allocator::new(Arc::clone(&global), 10);
        let second = Allocator::new(Arc::clone(&global), 10);

        let start = Instant::now();
        assert_eq!(first.allocate(10).await.unwrap(), 10);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The first connection drained the shared burst; the second has a
        // full local bucket but still waits out the shared schedule.
        assert_eq!(second.allocate(10).await.unwrap(), 10);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_millis(1100),
            "elapsed {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_allocation_refunds_the_global_reservation() {
        let global = shared(10);
        let first = Allocator::new(Arc::clone(&global), 10);
        let second = Allocator::new(Arc::clone(&global), 10);

        first.allocate(10).await.unwrap();

        // The second allocation charges the shared bucket and parks in the
        // ready-time sleep; cancel it partway through.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), second.allocate(10)).await;
        assert!(cancelled.is_err());

        // Its unaccrued tokens came back: one tenth of a second accrued
        // (and stayed spent), the rest was refunded.
        let balance = global.balance();
        assert!(balance.abs() < 0.1, "balance {balance}");
    }
}
