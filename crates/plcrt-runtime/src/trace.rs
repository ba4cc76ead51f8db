//! Live variable trace and force engine.
//!
//! A debug client configures an ordered set of traced variables and
//! then polls `fetch` for samples. A dedicated sampler thread captures
//! one block per control cycle under the exclusivity token and
//! publishes it into the ring buffer; `fetch` drains whole blocks.
//!
//! Sessions are identified by a strictly increasing token minted at
//! configure time. A fetch carrying a stale token gets status `Broken`
//! and no samples. A session whose client stops fetching for the
//! configured timeout is abandoned: the sampler exits and capture
//! stops until the next fetch or configure revives it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::module::LoadedModule;
use crate::ring::RingBuffer;
use crate::scheduler::{CycleCore, DebugLifecycle, PlcStatus};

/// Sampler poll granularity, both for token acquisition and the
/// inter-publish sleep that lets the cycle task reacquire the token.
const SAMPLER_STEP: Duration = Duration::from_millis(1);

/// Fetch wakeup granularity while waiting for data.
const FETCH_STEP: Duration = Duration::from_millis(1);

/// Bound on waiting for a sampler to acknowledge a stop request.
const SAMPLER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes of tick framing in front of each sample block.
const TICK_PREFIX: usize = 4;

/// Identifies one trace configuration generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionToken(pub u32);

/// Result of a `configure` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceHandle {
    /// Sampling is active under this token.
    Active(SessionToken),
    /// The order list was empty; nothing is sampled and no token is
    /// valid until the next non-empty configure.
    Suspended,
}

/// One variable to trace, optionally forced to a fixed value first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOrder {
    /// Index into the module's debug variable table.
    pub index: u32,
    /// Force value applied before tracing, raw bytes.
    pub force: Option<Vec<u8>>,
}

impl TraceOrder {
    /// Trace `index` without forcing it.
    #[must_use]
    pub fn plain(index: u32) -> Self {
        Self { index, force: None }
    }
}

/// One captured block: the cycle tick plus the concatenated raw values
/// of every traced variable, in configure order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSample {
    /// Cycle tick the block was captured at.
    pub tick: u32,
    /// Concatenated raw variable values.
    pub values: Vec<u8>,
}

/// Everything one `fetch` call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    /// Runtime status as seen by the client; `Broken` when the token
    /// was stale.
    pub status: PlcStatus,
    /// Drained sample blocks, oldest first.
    pub samples: Vec<TraceSample>,
}

struct TraceState {
    ring: RingBuffer,
    /// `(index, size)` per traced variable, configure order.
    spec: Vec<(u32, usize)>,
    /// Total payload width in bytes.
    width: usize,
    token: u32,
    active: bool,
    last_fetch: Instant,
    sampler_running: bool,
    sampler_stop: bool,
    /// Set while a configure is between stopping the old sampler and
    /// installing the new spec; blocks sampler respawns meanwhile.
    configuring: bool,
}

pub(crate) struct TraceShared {
    state: Mutex<TraceState>,
    cond: Condvar,
    core: Arc<CycleCore>,
    session_timeout: Duration,
    fetch_poll_limit: Duration,
    // Lets lifecycle hooks, which only see `&self`, spawn the sampler.
    weak_self: Weak<TraceShared>,
}

/// Public trace surface; owns the shared state jointly with the cycle
/// loop's lifecycle hooks and any live sampler thread.
pub struct TraceEngine {
    shared: Arc<TraceShared>,
    max_traced: usize,
}

impl TraceEngine {
    pub(crate) fn new(
        core: Arc<CycleCore>,
        ring_capacity: usize,
        max_traced: usize,
        session_timeout: Duration,
        fetch_poll_limit: Duration,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak_self| TraceShared {
            state: Mutex::new(TraceState {
                ring: RingBuffer::new(ring_capacity),
                spec: Vec::new(),
                width: 0,
                token: 0,
                active: false,
                last_fetch: Instant::now(),
                sampler_running: false,
                sampler_stop: false,
                configuring: false,
            }),
            cond: Condvar::new(),
            core,
            session_timeout,
            fetch_poll_limit,
            weak_self: weak_self.clone(),
        });
        Self { shared, max_traced }
    }

    /// The hooks the cycle loop calls around an activation.
    pub(crate) fn lifecycle(&self) -> Arc<dyn DebugLifecycle> {
        Arc::clone(&self.shared) as Arc<dyn DebugLifecycle>
    }

    /// Replace the trace set wholesale.
    ///
    /// The previous session's token becomes stale regardless of the
    /// outcome. An empty order list suspends sampling. Count and
    /// variable validation happen before any module-side mutation of
    /// the new set; a mid-list variable failure invalidates the whole
    /// session rather than keeping a partial one.
    pub fn configure(&self, orders: &[TraceOrder]) -> Result<TraceHandle, RuntimeError> {
        if orders.len() > self.max_traced {
            return Err(RuntimeError::TooManyTraced {
                requested: orders.len(),
                max: self.max_traced,
            });
        }
        let module = self
            .shared
            .core
            .current_module()
            .ok_or(RuntimeError::NoModuleLoaded)?;

        self.shared.lock_state().configuring = true;
        self.shared.stop_sampler();

        // Module calls run under the exclusivity token so the cycle
        // task never observes a half-updated trace set.
        self.shared.core.token.take();
        let applied = apply_orders(&module, orders);
        self.shared.core.token.give();

        let mut state = self.shared.lock_state();
        state.configuring = false;
        state.token = state.token.wrapping_add(1);
        state.ring.reset();
        state.spec.clear();
        state.width = 0;
        state.active = false;

        let spec = match applied {
            Ok(spec) => spec,
            Err(err) => return Err(err),
        };
        if spec.is_empty() {
            tracing::debug!("trace suspended: empty order list");
            return Ok(TraceHandle::Suspended);
        }

        state.width = spec.iter().map(|(_, size)| size).sum();
        state.spec = spec;
        state.active = true;
        state.last_fetch = Instant::now();
        let token = SessionToken(state.token);
        tracing::debug!(token = token.0, vars = state.spec.len(), width = state.width, "trace configured");

        if self.shared.core.is_running() {
            self.shared.spawn_sampler(&mut state, &module);
        }
        Ok(TraceHandle::Active(token))
    }

    /// Drain captured samples for the given session.
    ///
    /// Counts as client liveness even when the token is stale. A valid
    /// fetch waits (bounded) for at least one block before draining
    /// everything available; an empty batch just means no data yet.
    #[must_use]
    pub fn fetch(&self, token: SessionToken) -> FetchBatch {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        state.last_fetch = Instant::now();

        if !state.active || state.token != token.0 {
            return FetchBatch {
                status: PlcStatus::Broken,
                samples: Vec::new(),
            };
        }

        // A sampler that timed out on liveness is revived by the next
        // fetch, as long as the cycle loop still runs.
        if !state.sampler_running && !state.configuring && shared.core.is_running() {
            if let Some(module) = shared.core.current_module() {
                shared.spawn_sampler(&mut state, &module);
            }
        }

        let deadline = Instant::now() + shared.fetch_poll_limit;
        while state.ring.is_empty() && Instant::now() < deadline {
            let (next, _) = shared
                .cond
                .wait_timeout(state, FETCH_STEP)
                .expect("trace state poisoned");
            state = next;
            state.last_fetch = Instant::now();
            if !state.active || state.token != token.0 {
                return FetchBatch {
                    status: PlcStatus::Broken,
                    samples: Vec::new(),
                };
            }
        }

        let block = TICK_PREFIX + state.width.max(1);
        let width = state.width;
        let mut samples = Vec::new();
        loop {
            let run = state.ring.get_claim(block);
            if run.is_empty() {
                break;
            }
            if run.len() < block {
                // Wrap padding committed by the sampler; skip it.
                let pad = run.len();
                state.ring.get_finish(pad);
                continue;
            }
            let tick = u32::from_le_bytes([run[0], run[1], run[2], run[3]]);
            let values = run[TICK_PREFIX..TICK_PREFIX + width].to_vec();
            state.ring.get_finish(block);
            samples.push(TraceSample { tick, values });
        }

        let status = if shared.core.current_module().is_none() {
            PlcStatus::Empty
        } else if shared.core.is_running() {
            PlcStatus::Started
        } else {
            PlcStatus::Stopped
        };
        FetchBatch { status, samples }
    }
}

/// Validate and install a new trace set on the module. Returns the
/// `(index, size)` spec; the caller holds the exclusivity token.
fn apply_orders(
    module: &LoadedModule,
    orders: &[TraceOrder],
) -> Result<Vec<(u32, usize)>, RuntimeError> {
    module.reset_trace();
    let mut spec = Vec::with_capacity(orders.len());
    for order in orders {
        let value = module
            .get_variable(order.index)
            .map_err(|_| RuntimeError::VariableQuery { index: order.index })?;
        module.register_variable(order.index)?;
        spec.push((order.index, value.len()));
    }
    for order in orders {
        module.set_trace(order.index, order.force.is_some(), order.force.as_deref());
    }
    Ok(spec)
}

impl TraceShared {
    fn lock_state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().expect("trace state poisoned")
    }

    /// Ask a live sampler to exit and wait for the acknowledgment.
    fn stop_sampler(&self) {
        let mut state = self.lock_state();
        if !state.sampler_running {
            return;
        }
        state.sampler_stop = true;
        let deadline = Instant::now() + SAMPLER_STOP_TIMEOUT;
        while state.sampler_running {
            let now = Instant::now();
            if now >= deadline {
                tracing::error!("trace sampler did not acknowledge stop in time");
                break;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("trace state poisoned");
            state = next;
        }
        state.sampler_stop = false;
    }

    /// Spawn the sampler thread for the current spec. The caller holds
    /// the state lock; the running flag is set before the thread
    /// starts so a racing configure waits for it.
    fn spawn_sampler(self: &Arc<Self>, state: &mut TraceState, module: &Arc<LoadedModule>) {
        let shared = Arc::clone(self);
        let module = Arc::clone(module);
        let spec = state.spec.clone();
        let width = state.width;
        let session = state.token;
        state.sampler_running = true;
        state.sampler_stop = false;
        let spawned = thread::Builder::new()
            .name("plc-sampler".into())
            .spawn(move || {
                sampler_loop(&shared, &module, &spec, width, session);
                let mut state = shared.lock_state();
                state.sampler_running = false;
                state.sampler_stop = false;
                shared.cond.notify_all();
            });
        if let Err(err) = spawned {
            state.sampler_running = false;
            tracing::error!(%err, "failed to spawn trace sampler");
        }
    }

    /// Publish one gathered block into the ring.
    ///
    /// Reservation evicts whole oldest blocks while space is short.
    /// When the contiguous run before the physical end is still too
    /// small, a zero-filled run is committed as wrap padding (readers
    /// skip short runs) and the claim is retried once from the start
    /// of the buffer.
    fn commit_block(&self, scratch: &[u8], session: u32) {
        let needed = scratch.len();
        let mut state = self.lock_state();
        // A reconfigure raced this capture; its block belongs to a
        // dead session.
        if state.token != session {
            return;
        }
        if needed > state.ring.capacity() {
            tracing::warn!(needed, capacity = state.ring.capacity(), "trace capture dropped: block exceeds ring");
            return;
        }
        for _attempt in 0..2 {
            while state.ring.free() < needed && evict_unit(&mut state.ring, needed) > 0 {}
            let claim = state.ring.put_claim(needed);
            if claim.len() == needed {
                claim.copy_from_slice(scratch);
                state.ring.put_finish(needed);
                self.cond.notify_all();
                return;
            }
            let pad = claim.len();
            claim.fill(0);
            state.ring.put_finish(pad);
        }
        tracing::warn!(needed, free = state.ring.free(), "trace capture dropped: no room after retry");
    }
}

/// Drop one stored unit: a full block, or the short zero-padding run
/// in front of the physical wrap point. Returns bytes dropped.
fn evict_unit(ring: &mut RingBuffer, block: usize) -> usize {
    let run = ring.get_claim(block).len();
    if run == 0 {
        return 0;
    }
    let unit = run.min(block);
    ring.get_finish(unit);
    unit
}

impl DebugLifecycle for TraceShared {
    fn activate(&self) {
        // Fresh activation drops any stale captures. The exclusivity
        // token is never reset here: every holder gives it back, and a
        // reset could mint a second token under a concurrent holder.
        let mut state = self.lock_state();
        state.ring.reset();
        if state.active && !state.sampler_running && !state.configuring {
            state.last_fetch = Instant::now();
            // Re-arm the sampler for a session configured while the
            // loop was stopped.
            if let (Some(this), Some(module)) =
                (self.weak_self.upgrade(), self.core.current_module())
            {
                this.spawn_sampler(&mut state, &module);
            }
        }
    }

    fn deactivate(&self) {
        self.stop_sampler();
    }
}

fn sampler_loop(
    shared: &Arc<TraceShared>,
    module: &Arc<LoadedModule>,
    spec: &[(u32, usize)],
    width: usize,
    session: u32,
) {
    let mut last_published: Option<u32> = None;
    loop {
        {
            let state = shared.lock_state();
            if state.sampler_stop || state.token != session {
                break;
            }
            if state.last_fetch.elapsed() > shared.session_timeout {
                tracing::debug!("trace session abandoned: client stopped fetching");
                break;
            }
        }
        if !shared.core.is_running() {
            break;
        }
        if !shared.core.token.take_timeout(SAMPLER_STEP) {
            continue;
        }
        let tick = shared.core.current_tick();
        if last_published != Some(tick) {
            match gather_block(module, spec, width, tick) {
                Ok(scratch) => shared.commit_block(&scratch, session),
                Err(index) => {
                    tracing::warn!(index, tick, "trace capture skipped: variable read failed");
                }
            }
            last_published = Some(tick);
        }
        shared.core.token.give();
        thread::sleep(SAMPLER_STEP);
    }
}

/// Read every traced variable into one framed block. Any accessor
/// failure discards the whole block so framing never breaks.
fn gather_block(
    module: &LoadedModule,
    spec: &[(u32, usize)],
    width: usize,
    tick: u32,
) -> Result<Vec<u8>, u32> {
    let mut scratch = Vec::with_capacity(TICK_PREFIX + width.max(1));
    scratch.extend_from_slice(&tick.to_le_bytes());
    for &(index, size) in spec {
        let value = module.get_variable(index).map_err(|_| index)?;
        if value.len() != size {
            tracing::warn!(index, expected = size, actual = value.len(), "traced variable size changed");
        }
        let mut value = value;
        value.resize(size, 0);
        scratch.extend_from_slice(&value);
    }
    if width == 0 {
        scratch.push(0);
    }
    Ok(scratch)
}
