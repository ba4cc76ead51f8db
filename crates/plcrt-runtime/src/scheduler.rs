//! Periodic cycle scheduler.
//!
//! One persistent thread runs the control loop. An activation signal
//! starts it, a run flag keeps it going, and a stop acknowledgment
//! semaphore lets `stop` wait (bounded) for the loop to wind down. The
//! exclusivity token serializes module memory between the cycle task
//! and the trace sampler; whoever holds it may call into the module.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::io::{IoDriver, SharedProcessImage};
use crate::module::LoadedModule;
use crate::time::{ClockCell, TimeSpec64};

/// How long `stop` waits for the cycle loop's acknowledgment.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcStatus {
    /// No module bound.
    Empty,
    /// Module bound, cycle loop idle.
    Stopped,
    /// Cycle loop executing.
    Started,
    /// Reported by trace fetches whose session token is stale. The
    /// scheduler itself never enters this state.
    Broken,
}

/// Counting semaphore with a fixed ceiling, in the shape of the
/// firmware's kernel semaphores.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
    limit: u32,
}

impl Semaphore {
    /// A semaphore with the given initial count and ceiling.
    #[must_use]
    pub fn new(initial: u32, limit: u32) -> Self {
        Self {
            count: Mutex::new(initial.min(limit)),
            cond: Condvar::new(),
            limit,
        }
    }

    /// Increment the count; saturates at the ceiling.
    pub fn give(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        if *count < self.limit {
            *count += 1;
            self.cond.notify_one();
        }
    }

    /// Block until the count is nonzero, then decrement it.
    pub fn take(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }

    /// Like `take`, but gives up after `timeout`. Returns whether the
    /// semaphore was taken.
    #[must_use]
    pub fn take_timeout(&self, timeout: Duration) -> bool {
        let count = self.count.lock().expect("semaphore poisoned");
        let (mut count, result) = self
            .cond
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .expect("semaphore poisoned");
        if result.timed_out() && *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Forcibly set the count, releasing waiters if it became nonzero.
    pub fn reset(&self, count: u32) {
        let mut guard = self.count.lock().expect("semaphore poisoned");
        *guard = count.min(self.limit);
        if *guard > 0 {
            self.cond.notify_all();
        }
    }
}

/// Last-cycle timing, for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTiming {
    /// Module execution plus I/O refresh time of the last cycle.
    pub elapsed: Duration,
    /// Idle time of the last cycle, zero on overrun.
    pub slept: Duration,
}

/// State shared between the scheduler API, the cycle thread and the
/// trace engine.
pub(crate) struct CycleCore {
    pub(crate) module: Mutex<Option<Arc<LoadedModule>>>,
    pub(crate) run: AtomicBool,
    shutdown: AtomicBool,
    run_signal: Semaphore,
    stop_ack: Semaphore,
    /// Exclusivity token for module memory.
    pub(crate) token: Semaphore,
    pub(crate) tick: AtomicU32,
    tick_modulus: u32,
    pub(crate) clock: ClockCell,
    timing: Mutex<CycleTiming>,
    image: SharedProcessImage,
    driver: Mutex<Box<dyn IoDriver>>,
}

impl CycleCore {
    pub(crate) fn new(
        tick_modulus: u32,
        clock: ClockCell,
        image: SharedProcessImage,
        driver: Box<dyn IoDriver>,
    ) -> Self {
        Self {
            module: Mutex::new(None),
            run: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            run_signal: Semaphore::new(0, 1),
            stop_ack: Semaphore::new(0, 1),
            token: Semaphore::new(1, 1),
            tick: AtomicU32::new(0),
            tick_modulus,
            clock,
            timing: Mutex::new(CycleTiming::default()),
            image,
            driver: Mutex::new(driver),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub(crate) fn current_module(&self) -> Option<Arc<LoadedModule>> {
        self.module.lock().expect("module slot poisoned").clone()
    }

    pub(crate) fn current_tick(&self) -> u32 {
        self.tick.load(Ordering::SeqCst)
    }

    fn advance_tick(&self) -> u32 {
        let mut tick = self.tick.load(Ordering::SeqCst).wrapping_add(1);
        if self.tick_modulus != 0 && tick > self.tick_modulus {
            tick = 1;
        }
        self.tick.store(tick, Ordering::SeqCst);
        tick
    }
}

/// Hooks the cycle loop invokes around an activation. Implemented by
/// the trace engine; keeps the scheduler free of trace knowledge.
pub(crate) trait DebugLifecycle: Send + Sync {
    /// Called after module init, before the first cycle.
    fn activate(&self);
    /// Called when the run loop winds down.
    fn deactivate(&self);
}

/// Owns the persistent cycle thread.
pub struct CycleScheduler {
    core: Arc<CycleCore>,
    thread: Option<JoinHandle<()>>,
}

impl CycleScheduler {
    pub(crate) fn spawn(
        core: Arc<CycleCore>,
        debug: Arc<dyn DebugLifecycle>,
    ) -> Result<Self, RuntimeError> {
        let thread_core = Arc::clone(&core);
        let thread = thread::Builder::new()
            .name("plc-cycle".into())
            .spawn(move || cycle_thread(&thread_core, debug.as_ref()))
            .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
        Ok(Self {
            core,
            thread: Some(thread),
        })
    }

    /// Bind a module into the scheduler slot. Refused while running.
    pub(crate) fn bind_module(&self, module: Arc<LoadedModule>) -> Result<(), RuntimeError> {
        if self.core.is_running() {
            return Err(RuntimeError::PermissionDenied(
                "cannot replace the module while started".into(),
            ));
        }
        *self.core.module.lock().expect("module slot poisoned") = Some(module);
        Ok(())
    }

    /// Release the bound module. Refused while running.
    pub(crate) fn unbind_module(&self) -> Result<(), RuntimeError> {
        if self.core.is_running() {
            return Err(RuntimeError::PermissionDenied(
                "cannot unload while started".into(),
            ));
        }
        let mut slot = self.core.module.lock().expect("module slot poisoned");
        if slot.is_none() {
            return Err(RuntimeError::NoModuleLoaded);
        }
        *slot = None;
        Ok(())
    }

    /// Begin cyclic execution. A start with nothing bound or with the
    /// loop already running is a warned no-op.
    pub fn start(&self) {
        if self.core.current_module().is_none() {
            tracing::warn!("start ignored: no module loaded");
            return;
        }
        if self.core.is_running() {
            tracing::warn!("start ignored: already started");
            return;
        }
        self.core.run.store(true, Ordering::SeqCst);
        self.core.run_signal.give();
    }

    /// Request the cycle loop to stop and wait (bounded) for its
    /// acknowledgment. The runtime is considered stopped afterwards
    /// even if the acknowledgment never arrived.
    pub fn stop(&self) {
        if !self.core.is_running() {
            return;
        }
        // Discard any stale acknowledgment from an earlier raced stop.
        self.core.stop_ack.reset(0);
        self.core.run.store(false, Ordering::SeqCst);
        if !self.core.stop_ack.take_timeout(STOP_ACK_TIMEOUT) {
            tracing::error!("cycle loop did not acknowledge stop in time");
            self.core.stop_ack.reset(0);
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> PlcStatus {
        if self.core.current_module().is_none() {
            PlcStatus::Empty
        } else if self.core.is_running() {
            PlcStatus::Started
        } else {
            PlcStatus::Stopped
        }
    }

    /// Last-cycle timing snapshot.
    #[must_use]
    pub fn timing(&self) -> CycleTiming {
        *self.core.timing.lock().expect("cycle timing poisoned")
    }

    /// The most recently executed cycle tick.
    #[must_use]
    pub fn current_tick(&self) -> u32 {
        self.core.current_tick()
    }
}

impl Drop for CycleScheduler {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.run.store(false, Ordering::SeqCst);
        self.core.run_signal.give();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("cycle thread panicked");
            }
        }
    }
}

fn cycle_thread(core: &CycleCore, debug: &dyn DebugLifecycle) {
    loop {
        core.run_signal.take();
        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !core.is_running() {
            // Stop raced with start before the first cycle ran;
            // acknowledge so the stopping caller is not left waiting.
            core.stop_ack.give();
            continue;
        }
        let Some(module) = core.current_module() else {
            core.run.store(false, Ordering::SeqCst);
            continue;
        };

        // Activation: fresh process image, module init, debug session
        // reset, logical clock seeded from wall time.
        core.image.lock().reset();
        module.init();
        debug.activate();
        core.tick.store(0, Ordering::SeqCst);
        core.clock.set(TimeSpec64::wall_now());
        let period = module.cycle_period();
        tracing::info!(module = %module.name(), ?period, "cycle loop started");

        while core.is_running() {
            let cycle_start = Instant::now();
            let tick = core.advance_tick();

            {
                let mut image = core.image.lock();
                core.driver
                    .lock()
                    .expect("io driver poisoned")
                    .read_inputs(&mut image);
            }

            core.token.take();
            module.run_cycle(tick);
            core.token.give();

            {
                let mut image = core.image.lock();
                if !core.is_running() {
                    image.set_outputs_safe();
                }
                core.driver
                    .lock()
                    .expect("io driver poisoned")
                    .write_outputs(&image);
            }

            core.clock.advance(period);

            let elapsed = cycle_start.elapsed();
            // Overruns shorten the idle time to zero; the next cycle
            // starts immediately rather than being skipped.
            let slept = period.saturating_sub(elapsed);
            *core.timing.lock().expect("cycle timing poisoned") = CycleTiming { elapsed, slept };
            if slept.is_zero() {
                tracing::debug!(?elapsed, ?period, tick, "cycle overrun");
            } else {
                thread::sleep(slept);
            }
        }

        debug.deactivate();
        {
            let mut image = core.image.lock();
            image.set_outputs_safe();
            core.driver
                .lock()
                .expect("io driver poisoned")
                .write_outputs(&image);
        }
        tracing::info!(module = %module.name(), "cycle loop stopped");
        core.stop_ack.give();
    }
}
