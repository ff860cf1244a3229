use crate::error::{ConfigError, Result, SyncError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Work driven by a periodic loop thread.
///
/// `setup` runs once on the loop thread before the first tick and its error
/// is reported back to the spawner; `tick` runs once per period and its
/// errors are logged and swallowed so a transient failure never kills the
/// loop; `teardown` runs once after the last tick.
pub trait LoopTask: Send + 'static {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn tick(&mut self) -> Result<()>;
    fn teardown(&mut self) {}
}

/// Pacing parameters for a periodic loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopRate {
    /// Target tick frequency in Hz. Must be positive.
    pub frequency: f64,
    /// Measured frequency below `warning_ratio * frequency` over a review
    /// window raises the advisory warning flag.
    pub warning_ratio: f64,
    /// Length of the frequency review window.
    pub review: Duration,
}

impl LoopRate {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            warning_ratio: 0.9,
            review: Duration::from_secs(1),
        }
    }
}

/// How long a spawner waits for the setup handshake before giving up.
pub const DEFAULT_PATIENCE: Duration = Duration::from_secs(5);

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    warning: AtomicBool,
    // measured frequency in millihertz, written once per review window
    measured_mhz: AtomicU64,
}

/// Control handle for a running loop. Dropping the handle stops the loop
/// and joins its thread.
pub struct LoopHandle {
    name: String,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Stop ticking without stopping the thread; pacing continues so
    /// `resume` picks the cadence back up immediately.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Advisory flag: the last review window ran below the warning ratio.
    /// Never fatal and never stops the loop on its own.
    pub fn is_warning(&self) -> bool {
        self.shared.warning.load(Ordering::Acquire)
    }

    /// Frequency measured over the last completed review window, in Hz.
    pub fn measured_hz(&self) -> f64 {
        self.shared.measured_mhz.load(Ordering::Acquire) as f64 / 1000.0
    }

    /// Cooperative stop: the in-flight tick finishes, teardown runs, and
    /// the thread is joined. No tick can start after this returns.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "loop thread panicked");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Spawn `task` on its own thread ticking at `rate`.
///
/// Blocks until the task's `setup` reports through the handshake channel,
/// so a setup failure comes back synchronously and a failed loop never
/// ticks. `patience` bounds the wait.
pub fn spawn<T: LoopTask>(
    name: impl Into<String>,
    mut task: T,
    rate: LoopRate,
    patience: Duration,
) -> Result<LoopHandle> {
    let name = name.into();
    if !(rate.frequency > 0.0) {
        return Err(ConfigError::BadFrequency(name).into());
    }

    let shared = Arc::new(Shared {
        running: AtomicBool::new(true),
        paused: AtomicBool::new(false),
        warning: AtomicBool::new(false),
        measured_mhz: AtomicU64::new(0),
    });
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

    let thread_shared = Arc::clone(&shared);
    let thread_name = name.clone();
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            match task.setup() {
                Ok(()) => {
                    if ready_tx.send(Ok(())).is_err() {
                        // spawner gave up waiting
                        task.teardown();
                        return;
                    }
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            }
            run(&thread_name, &mut task, rate, &thread_shared);
            task.teardown();
            debug!(name = %thread_name, "loop finished");
        })
        .map_err(|e| SyncError::Spawn(name.clone(), e.to_string()))?;

    match ready_rx.recv_timeout(patience) {
        Ok(Ok(())) => Ok(LoopHandle {
            name,
            shared,
            thread: Some(handle),
        }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            shared.running.store(false, Ordering::Release);
            if handle.is_finished() {
                let _ = handle.join();
                Err(SyncError::SetupLost(name))
            } else {
                Err(SyncError::SetupTimeout(name, patience))
            }
        }
    }
}

fn run<T: LoopTask>(name: &str, task: &mut T, rate: LoopRate, shared: &Shared) {
    let period = Duration::from_secs_f64(1.0 / rate.frequency);
    let sleeper = spin_sleep::SpinSleeper::default();

    let mut window_start = Instant::now();
    let mut window_ticks: u32 = 0;
    let mut window_overruns: u32 = 0;
    let mut window_active = false;

    while shared.running.load(Ordering::Acquire) {
        let start = Instant::now();
        if !shared.paused.load(Ordering::Acquire) {
            if let Err(e) = task.tick() {
                warn!(name, "tick failed: {e}");
            }
            window_ticks += 1;
            window_active = true;
        }

        let elapsed = start.elapsed();
        if elapsed < period {
            sleeper.sleep(period - elapsed);
        } else {
            // overrun: skip the sleep, never sleep a negative duration
            window_overruns += 1;
        }

        let window = window_start.elapsed();
        if window >= rate.review {
            let measured = window_ticks as f64 / window.as_secs_f64();
            shared
                .measured_mhz
                .store((measured * 1000.0) as u64, Ordering::Release);
            let degraded = window_active && measured < rate.warning_ratio * rate.frequency;
            shared.warning.store(degraded, Ordering::Release);
            if degraded {
                warn!(
                    name,
                    target = rate.frequency,
                    measured,
                    overruns = window_overruns,
                    "loop running below warning threshold"
                );
            }
            window_start = Instant::now();
            window_ticks = 0;
            window_overruns = 0;
            window_active = false;
        }
    }
}
