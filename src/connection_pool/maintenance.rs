// Copyright 2020 Joyent, Inc.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{crit, debug, error, trace, Logger};

use crate::connection_pool::types::WorkerSignal;
use crate::error::Error;

/// The work the maintenance worker performs each round.
pub(crate) trait Maintain: Send + Sync + 'static {
    fn sweep_interval(&self) -> Duration;
    fn keep_alive_interval(&self) -> Option<Duration>;
    /// Evict every expired idle connection. Returns the number evicted.
    fn evict_expired(&self) -> usize;
    /// Ping one idle connection per node. Returns the number found alive.
    fn keep_alive(&self) -> usize;
    fn set_healthy(&self, healthy: bool);
}

// Handle to the maintenance thread.
pub(crate) struct MaintenanceWorker {
    signal: WorkerSignal,
    thread: Option<thread::JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub(crate) fn spawn<M>(target: Weak<M>, log: Logger) -> Result<Self, Error>
    where
        M: Maintain,
    {
        let signal = WorkerSignal::new();
        let signal_clone = signal.clone();
        let thread = thread::Builder::new()
            .name(String::from("pool-maintenance"))
            .spawn(move || maintenance_loop(target, signal_clone, log))?;

        Ok(MaintenanceWorker {
            signal,
            thread: Some(thread),
        })
    }

    /// Ask the worker to exit without waiting for it.
    pub(crate) fn signal_stop(&self) {
        self.signal.stop()
    }

    /// Ask the worker to exit and wait for it, unless called from the worker
    /// thread itself.
    pub(crate) fn stop(mut self) {
        self.signal.stop();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn maintenance_loop<M>(target: Weak<M>, signal: WorkerSignal, log: Logger)
where
    M: Maintain,
{
    let mut restart_backoff = ExponentialBackoff::default();
    let mut last_keep_alive = Instant::now();

    loop {
        // Intervals are re-read every round since they are tunable.
        let interval = match target.upgrade() {
            Some(pool) => pool.sweep_interval(),
            None => break,
        };
        if signal.wait_for_stop(interval) {
            break;
        }

        let pool = match target.upgrade() {
            Some(pool) => pool,
            None => break,
        };

        let round = panic::catch_unwind(AssertUnwindSafe(|| {
            run_round(&*pool, &mut last_keep_alive, &log)
        }));

        match round {
            Ok(()) => {
                restart_backoff.reset();
                pool.set_healthy(true);
            }
            Err(_) => match restart_backoff.next_backoff() {
                Some(delay) => {
                    error!(
                        log,
                        "maintenance round panicked, restarting in {:?}", delay
                    );
                    drop(pool);
                    if signal.wait_for_stop(delay) {
                        break;
                    }
                }
                None => {
                    crit!(
                        log,
                        "maintenance rounds keep panicking, giving up; \
                         idle connections will no longer be swept"
                    );
                    pool.set_healthy(false);
                    break;
                }
            },
        }
    }
    trace!(log, "maintenance_loop exiting");
}

fn run_round<M>(pool: &M, last_keep_alive: &mut Instant, log: &Logger)
where
    M: Maintain,
{
    let evicted = pool.evict_expired();
    if evicted > 0 {
        debug!(log, "evicted {} expired idle connections", evicted);
    }

    if let Some(keep_alive_interval) = pool.keep_alive_interval() {
        if last_keep_alive.elapsed() >= keep_alive_interval {
            let alive = pool.keep_alive();
            trace!(log, "keep-alive verified {} idle connections", alive);
            *last_keep_alive = Instant::now();
        }
    }
}
