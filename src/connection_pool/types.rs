// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

// Socket open and liveness probe timeout in milliseconds
pub const DEFAULT_SOCKET_TIMEOUT: u64 = 10_000;
// Keep-alive interval in milliseconds
pub const DEFAULT_KEEP_ALIVE_INTERVAL: u64 = 30_000;
// Soft limit on open connections
pub const DEFAULT_SOFT_LIMIT: u32 = 100;
// Idle timeout in milliseconds
pub const DEFAULT_IDLE_TIMEOUT: u64 = 60_000;
// Fraction of the soft limit at which idle connections are closed early
pub const DEFAULT_EARLY_CLOSE_LEVEL: f64 = 0.8;
// Safety-net poll interval for blocked reservations in milliseconds
pub const DEFAULT_WAIT_POLL_INTERVAL: u64 = 100;
// The maintenance worker never runs more often than this
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// The total number of open connections, idle or checked out
    pub total_connections: ConnectionCount,
    /// The count of idle connections in the pool
    pub idle_connections: ConnectionCount,
    /// The count of connections checked out by callers
    pub in_use_connections: ConnectionCount,
    /// The number of executions currently holding at least one connection
    pub executions: usize,
}

/// The configuration options for a connection pool. Every field is optional
/// and falls back to the documented default.
#[derive(Debug, Default)]
pub struct ConnectionPoolOptions {
    /// Timeout in milliseconds for opening a new socket and for the liveness
    /// probe. The default is 10 seconds.
    pub socket_timeout: Option<u64>,
    /// Interval in milliseconds at which one idle connection per node is
    /// pinged. Zero disables keep-alive. The default is 30 seconds.
    pub keep_alive_interval: Option<u64>,
    /// Advisory cap on open connections. Executions that already hold a
    /// connection may exceed it. The default is 100.
    pub soft_limit: Option<u32>,
    /// Time in milliseconds an unused connection may stay pooled before it is
    /// closed. The default is 60 seconds.
    pub idle_timeout: Option<u64>,
    /// Fraction of the soft limit at which a reservation that finds no idle
    /// connection closes the idle connection nearest to expiry. The default
    /// is 0.8.
    pub early_close_level: Option<f64>,
    /// An optional timeout in milliseconds for blocking reservations. If not
    /// specified a reservation waits until admitted or cancelled.
    pub claim_timeout: Option<u64>,
    /// Bound in milliseconds on how long a blocked reservation sleeps between
    /// re-checks, independent of release notifications. The default is 100.
    pub wait_poll_interval: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

/// The runtime-tunable pool settings.
#[derive(Debug)]
pub struct PoolSettings {
    socket_timeout: AtomicU64,
    keep_alive_interval: AtomicU64,
    soft_limit: AtomicU32,
    idle_timeout: AtomicU64,
    early_close_level: AtomicU64,
    claim_timeout: Option<u64>,
    wait_poll_interval: u64,
}

impl PoolSettings {
    pub(crate) fn from_options(cpo: &ConnectionPoolOptions) -> Self {
        let settings = PoolSettings {
            socket_timeout: AtomicU64::new(
                cpo.socket_timeout.unwrap_or(DEFAULT_SOCKET_TIMEOUT),
            ),
            keep_alive_interval: AtomicU64::new(
                cpo.keep_alive_interval
                    .unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL),
            ),
            soft_limit: AtomicU32::new(
                cpo.soft_limit.unwrap_or(DEFAULT_SOFT_LIMIT),
            ),
            idle_timeout: AtomicU64::new(
                cpo.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            ),
            early_close_level: AtomicU64::new(0),
            claim_timeout: cpo.claim_timeout,
            wait_poll_interval: cpo
                .wait_poll_interval
                .unwrap_or(DEFAULT_WAIT_POLL_INTERVAL)
                .max(1),
        };
        settings.set_early_close_level(
            cpo.early_close_level.unwrap_or(DEFAULT_EARLY_CLOSE_LEVEL),
        );
        settings
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout.load(Ordering::Relaxed))
    }

    pub fn set_socket_timeout(&self, ms: u64) {
        self.socket_timeout.store(ms, Ordering::Relaxed)
    }

    /// `None` when keep-alive is disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive_interval.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_keep_alive_interval(&self, ms: u64) {
        self.keep_alive_interval.store(ms, Ordering::Relaxed)
    }

    pub fn soft_limit(&self) -> u32 {
        self.soft_limit.load(Ordering::Relaxed)
    }

    pub fn set_soft_limit(&self, limit: u32) {
        self.soft_limit.store(limit, Ordering::Relaxed)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, ms: u64) {
        self.idle_timeout.store(ms, Ordering::Relaxed)
    }

    pub fn early_close_level(&self) -> f64 {
        f64::from_bits(self.early_close_level.load(Ordering::Relaxed))
    }

    /// Values outside `[0, 1]` are clamped; NaN is treated as 1.
    pub fn set_early_close_level(&self, level: f64) {
        let level = if level.is_nan() {
            1.0
        } else {
            level.max(0.0).min(1.0)
        };
        self.early_close_level
            .store(level.to_bits(), Ordering::Relaxed)
    }

    pub fn claim_timeout(&self) -> Option<Duration> {
        self.claim_timeout.map(Duration::from_millis)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval)
    }

    /// The maintenance worker period: the greatest common divisor of the
    /// keep-alive interval and the idle timeout, but never under a second.
    pub fn sweep_interval(&self) -> Duration {
        sweep_interval(
            self.keep_alive_interval.load(Ordering::Relaxed),
            self.idle_timeout.load(Ordering::Relaxed),
        )
    }

    // Opening another socket at this total requires admission.
    pub(crate) fn at_soft_limit(&self, total_open: usize) -> bool {
        total_open >= self.soft_limit() as usize
    }

    pub(crate) fn at_early_close_level(&self, total_open: usize) -> bool {
        total_open as f64
            >= self.early_close_level() * f64::from(self.soft_limit())
    }
}

fn sweep_interval(keep_alive_ms: u64, idle_timeout_ms: u64) -> Duration {
    Duration::from_millis(gcd(keep_alive_ms, idle_timeout_ms))
        .max(MIN_SWEEP_INTERVAL)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and able to service reservations.
    Running,
    /// The connection pool is performing cleanup and is no longer accepting
    /// reservations.
    Stopping,
    /// The connection pool is stopped and is no longer accepting
    /// reservations.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopping => String::from("stopping").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

/// Cancels a blocked reservation. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// Wakes reservations blocked on the soft limit. The mutex guards no data; it
// only orders the admission check against notifications so a release between
// the check and the wait is not lost.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct AvailabilitySignal(Mutex<()>, Condvar);

impl AvailabilitySignal {
    pub fn lock(&self) -> MutexGuard<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(
        &self,
        g: MutexGuard<'a, ()>,
        timeout: Duration,
    ) -> MutexGuard<'a, ()> {
        match self.1.wait_timeout(g, timeout) {
            Ok((g, _)) => g,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify_all(&self) {
        let _g = self.lock();
        self.1.notify_all()
    }
}

// Internal data type used to tell the maintenance worker to exit.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct WorkerSignal(Arc<(Mutex<bool>, Condvar)>);

impl WorkerSignal {
    pub fn new() -> Self {
        WorkerSignal::default()
    }

    pub fn stop(&self) {
        let mut stopped =
            (self.0).0.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        (self.0).1.notify_all()
    }

    /// Sleep for up to `timeout`. Returns true if stop was requested.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        let stopped = (self.0).0.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = (self.0)
            .1
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

impl Clone for WorkerSignal {
    fn clone(&self) -> WorkerSignal {
        WorkerSignal(Arc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn sweep_interval_uses_gcd() {
        assert_eq!(sweep_interval(30_000, 60_000), Duration::from_secs(30));
        assert_eq!(sweep_interval(4_000, 6_000), Duration::from_secs(2));
        // Never under a second.
        assert_eq!(sweep_interval(1_500, 1_000), Duration::from_secs(1));
        // Keep-alive disabled.
        assert_eq!(sweep_interval(0, 5_000), Duration::from_secs(5));
        assert_eq!(sweep_interval(0, 0), Duration::from_secs(1));
    }

    #[test]
    fn settings_defaults_and_tuning() {
        let settings = PoolSettings::from_options(&Default::default());
        assert_eq!(settings.soft_limit(), DEFAULT_SOFT_LIMIT);
        assert_eq!(
            settings.idle_timeout(),
            Duration::from_millis(DEFAULT_IDLE_TIMEOUT)
        );
        assert_eq!(settings.claim_timeout(), None);

        settings.set_keep_alive_interval(0);
        assert_eq!(settings.keep_alive_interval(), None);

        settings.set_early_close_level(1.7);
        assert_eq!(settings.early_close_level(), 1.0);
        settings.set_early_close_level(-0.2);
        assert_eq!(settings.early_close_level(), 0.0);

        settings.set_soft_limit(10);
        settings.set_early_close_level(0.5);
        assert!(!settings.at_early_close_level(4));
        assert!(settings.at_early_close_level(5));
        assert!(!settings.at_soft_limit(9));
        assert!(settings.at_soft_limit(10));
    }

    #[test]
    fn worker_signal_wakes_sleeper() {
        let signal = WorkerSignal::new();
        let sleeper = signal.clone();
        let handle =
            thread::spawn(move || sleeper.wait_for_stop(Duration::from_secs(30)));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(!WorkerSignal::new().wait_for_stop(Duration::from_millis(10)));
    }
}
