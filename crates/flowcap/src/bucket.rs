//! A token bucket with reservations.
//!
//! The bucket refills at a sustained `rate` (tokens per second, fractional
//! carry included) and holds at most `burst` tokens. Callers that need more
//! tokens than are currently available take out a [`Reservation`]: the
//! bucket is debited immediately (its balance may go negative, representing
//! future debt) and the reservation carries the instant at which the tokens
//! will have accrued. A reservation that is dropped before that instant
//! refunds the portion that had not yet accrued.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Error returned by [`TokenBucket::wait`] when the request can never be
/// satisfied: it exceeds the bucket's burst capacity, or the bucket has a
/// zero rate and not enough balance.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("request can never be satisfied by this bucket")]
pub struct Unsatisfiable;

/// A rate limiter over an abstract token supply.
///
/// All operations take `&self`; the bucket is internally synchronized and
/// is shared between connections behind an `Arc` when used as the global
/// limiter.
#[derive(Debug)]
pub struct TokenBucket {
    /// Balance, schedule, and tuning, under one lock.
    state: Mutex<State>,
}

/// The mutable portion of a bucket.
#[derive(Debug)]
struct State {
    /// Sustained refill rate in tokens per second. May be `f64::INFINITY`,
    /// meaning only `burst` bounds a single request.
    rate: f64,
    /// Maximum number of tokens the bucket will hold.
    burst: u64,
    /// Current balance. Negative values are debt owed to outstanding
    /// reservations; the balance never exceeds `burst`.
    tokens: f64,
    /// When `tokens` was last brought up to date.
    refilled: Instant,
}

impl State {
    /// Bring `tokens` up to date with the time that has passed.
    fn refill(&mut self, now: Instant) {
        if now <= self.refilled {
            return;
        }
        if self.rate.is_infinite() {
            self.tokens = self.burst as f64;
        } else {
            let dt = (now - self.refilled).as_secs_f64();
            self.tokens = (self.tokens + dt * self.rate).min(self.burst as f64);
        }
        self.refilled = now;
    }
}

impl TokenBucket {
    /// Create a bucket that refills at `rate` tokens per second and holds at
    /// most `burst` tokens. It starts full.
    pub fn new(rate: f64, burst: u64) -> Self {
        TokenBucket {
            state: Mutex::new(State {
                rate: rate.max(0.0),
                burst,
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Debit `n` tokens now, and return a [`Reservation`] carrying the
    /// instant at which they will all have accrued.
    ///
    /// Returns `None` if the bucket can never accrue `n` tokens: `n` exceeds
    /// the burst capacity, or the deficit would only fill at a zero rate.
    pub fn reserve(&self, n: u64) -> Option<Reservation<'_>> {
        let mut state = self.state.lock().expect("poisoned lock");
        let now = Instant::now();
        state.refill(now);

        if n > state.burst {
            return None;
        }
        let balance_after = state.tokens - n as f64;
        let ready_at = if balance_after >= 0.0 || state.rate.is_infinite() {
            now
        } else if state.rate <= 0.0 {
            return None;
        } else {
            match Duration::try_from_secs_f64(-balance_after / state.rate) {
                Ok(deficit) => now + deficit,
                Err(_) => return None,
            }
        };
        state.tokens = balance_after;

        Some(Reservation {
            bucket: self,
            n,
            ready_at,
            armed: true,
        })
    }

    /// Debit `n` tokens and sleep until they have accrued.
    ///
    /// Cancel-safe: dropping the returned future refunds the tokens that had
    /// not yet accrued, through the underlying reservation.
    pub async fn wait(&self, n: u64) -> Result<(), Unsatisfiable> {
        let reservation = self.reserve(n).ok_or(Unsatisfiable)?;
        let at = reservation.ready_at();
        tokio::time::sleep_until(at).await;
        reservation.commit();
        Ok(())
    }

    /// Remove up to `n` tokens of available credit.
    ///
    /// Never pushes the balance below zero; existing debt is untouched.
    pub fn drain(&self, n: u64) {
        let mut state = self.state.lock().expect("poisoned lock");
        state.refill(Instant::now());
        if state.tokens > 0.0 {
            state.tokens = (state.tokens - n as f64).max(0.0);
        }
    }

    /// Change the sustained rate. Takes effect immediately; instants already
    /// handed out in reservations keep their old-rate schedule.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().expect("poisoned lock");
        state.refill(Instant::now());
        state.rate = rate.max(0.0);
    }

    /// Change the burst capacity, clamping any excess balance.
    pub fn set_burst(&self, burst: u64) {
        let mut state = self.state.lock().expect("poisoned lock");
        state.refill(Instant::now());
        state.burst = burst;
        state.tokens = state.tokens.min(burst as f64);
    }

    /// The current sustained rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().expect("poisoned lock").rate
    }

    /// The current burst capacity.
    pub fn burst(&self) -> u64 {
        self.state.lock().expect("poisoned lock").burst
    }

    /// The current balance, refilled to this instant. Negative values are
    /// debt owed to outstanding reservations.
    pub fn balance(&self) -> f64 {
        let mut state = self.state.lock().expect("poisoned lock");
        state.refill(Instant::now());
        state.tokens
    }

    /// Credit back the part of a reservation that has not accrued yet.
    ///
    /// Tokens scheduled to accrue before `now` are deemed spent and stay
    /// charged; only the span between `now` and `ready_at` is refunded,
    /// valued at the current rate.
    fn refund(&self, n: u64, ready_at: Instant) {
        let mut state = self.state.lock().expect("poisoned lock");
        let now = Instant::now();
        if ready_at <= now {
            return;
        }
        let pending = (ready_at - now).as_secs_f64() * state.rate;
        let refund = pending.min(n as f64);
        if refund <= 0.0 {
            return;
        }
        state.refill(now);
        state.tokens = (state.tokens + refund).min(state.burst as f64);
    }
}

/// A charge of `n` tokens against a [`TokenBucket`], ready at a known
/// instant.
///
/// Must be consumed exactly once: either [`commit`](Reservation::commit) it
/// once the tokens have been used, or drop it (or call
/// [`cancel`](Reservation::cancel)) to refund whatever has not yet accrued.
#[must_use = "dropping a reservation cancels it"]
#[derive(Debug)]
pub struct Reservation<'a> {
    /// The bucket this reservation was debited from.
    bucket: &'a TokenBucket,
    /// How many tokens were debited.
    n: u64,
    /// When the debited tokens will all have accrued.
    ready_at: Instant,
    /// Cleared on commit, so that drop no longer refunds.
    armed: bool,
}

impl Reservation<'_> {
    /// The instant at which the reserved tokens will all have accrued.
    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// How many tokens this reservation holds.
    pub fn amount(&self) -> u64 {
        self.n
    }

    /// Consume the reservation, keeping the tokens charged.
    pub fn commit(mut self) {
        self.armed = false;
    }

    /// Cancel the reservation, refunding the tokens that had not accrued.
    pub fn cancel(self) {
        // Drop performs the refund.
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.refund(self.n, self.ready_at);
        }
    }
}
