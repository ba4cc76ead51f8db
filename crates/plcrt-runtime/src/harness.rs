//! In-process stand-ins for bound modules, used by tests.
//!
//! A [`ScriptedModule`] plays the role of a relocated image: it
//! declares debug variables as raw byte vectors, counts entry-point
//! calls, and records two kinds of contract violations — being entered
//! without its base installed in the slot, and a cycle call overlapping
//! a debug accessor call. A [`ScriptedLinker`] binds images whose
//! payload bytes are the UTF-8 name of a registered script.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::flash::FlashRegion;
use crate::image::{ImageHeader, HEADER_SIZE};
use crate::module::{
    symbols, BaseSlot, BoundImage, ExecBase, LinkError, LinkSource, ModuleExport, ModuleLinker,
    VariableFault,
};
use crate::resolver::SymbolResolver;

/// Per-cycle behavior: receives the tick and the variable table.
pub type CycleScript = Box<dyn FnMut(u32, &mut Vec<Vec<u8>>) + Send>;

struct ScriptInner {
    name: SmolStr,
    period: Duration,
    base: u32,
    slot: BaseSlot,
    vars: Mutex<Vec<Vec<u8>>>,
    forced: Mutex<Vec<Option<Vec<u8>>>>,
    traced: Mutex<Vec<u32>>,
    on_cycle: Mutex<Option<CycleScript>>,
    cycle_delay: Mutex<Duration>,
    omitted: Vec<&'static str>,
    init_calls: AtomicU32,
    cycle_calls: AtomicU32,
    last_tick: AtomicU32,
    abi_violations: AtomicU32,
    in_cycle: AtomicBool,
    in_accessor: AtomicBool,
    overlaps: AtomicU32,
}

impl ScriptInner {
    fn check_base(&self) {
        if self.slot.current() != self.base {
            self.abi_violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enter_accessor(&self) {
        self.check_base();
        if self.in_cycle.load(Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.in_accessor.store(true, Ordering::SeqCst);
    }

    fn exit_accessor(&self) {
        self.in_accessor.store(false, Ordering::SeqCst);
    }
}

/// Scripted module definition and its observation surface.
#[derive(Clone)]
pub struct ScriptedModule {
    inner: Arc<ScriptInner>,
}

impl ScriptedModule {
    /// A module named `name` with the given cycle period and declared
    /// variables (initial raw values).
    #[must_use]
    pub fn new(name: &str, period: Duration, vars: Vec<Vec<u8>>) -> Self {
        let count = vars.len();
        Self {
            inner: Arc::new(ScriptInner {
                name: name.into(),
                period,
                // Any stable nonzero value works as an exec base.
                base: crc32fast::hash(name.as_bytes()) | 1,
                slot: BaseSlot::new(),
                vars: Mutex::new(vars),
                forced: Mutex::new(vec![None; count]),
                traced: Mutex::new(Vec::new()),
                on_cycle: Mutex::new(None),
                cycle_delay: Mutex::new(Duration::ZERO),
                omitted: Vec::new(),
                init_calls: AtomicU32::new(0),
                cycle_calls: AtomicU32::new(0),
                last_tick: AtomicU32::new(0),
                abi_violations: AtomicU32::new(0),
                in_cycle: AtomicBool::new(false),
                in_accessor: AtomicBool::new(false),
                overlaps: AtomicU32::new(0),
            }),
        }
    }

    /// Run `script` on every cycle with mutable access to the
    /// variables.
    #[must_use]
    pub fn with_cycle(self, script: CycleScript) -> Self {
        *self.inner.on_cycle.lock().expect("script state poisoned") = Some(script);
        self
    }

    /// Make every cycle take at least `delay`, widening the window in
    /// which an overlapping accessor call would be caught.
    #[must_use]
    pub fn with_cycle_delay(self, delay: Duration) -> Self {
        self.set_cycle_delay(delay);
        self
    }

    /// Change the per-cycle delay of an already-built module.
    pub fn set_cycle_delay(&self, delay: Duration) {
        *self.inner.cycle_delay.lock().expect("script state poisoned") = delay;
    }

    /// Pretend the image does not export `symbol`.
    #[must_use]
    pub fn without_symbol(mut self, symbol: &'static str) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("script already shared")
            .omitted
            .push(symbol);
        self
    }

    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.inner.name
    }

    pub fn set_value(&self, index: usize, value: Vec<u8>) {
        self.inner.vars.lock().expect("script state poisoned")[index] = value;
    }

    #[must_use]
    pub fn value(&self, index: usize) -> Vec<u8> {
        self.inner.vars.lock().expect("script state poisoned")[index].clone()
    }

    #[must_use]
    pub fn forced_value(&self, index: usize) -> Option<Vec<u8>> {
        self.inner.forced.lock().expect("script state poisoned")[index].clone()
    }

    /// Indices currently in the module-side trace set, insertion order.
    #[must_use]
    pub fn traced_indices(&self) -> Vec<u32> {
        self.inner.traced.lock().expect("script state poisoned").clone()
    }

    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.inner.init_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cycle_calls(&self) -> u32 {
        self.inner.cycle_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_tick(&self) -> u32 {
        self.inner.last_tick.load(Ordering::SeqCst)
    }

    /// Entry-point calls made without the base installed in the slot.
    #[must_use]
    pub fn abi_violations(&self) -> u32 {
        self.inner.abi_violations.load(Ordering::SeqCst)
    }

    /// Cycle calls that overlapped a debug accessor call (or vice
    /// versa). Zero when the exclusivity token is honored.
    #[must_use]
    pub fn overlaps(&self) -> u32 {
        self.inner.overlaps.load(Ordering::SeqCst)
    }
}

struct ScriptedImage {
    inner: Arc<ScriptInner>,
}

impl ScriptedImage {
    fn exports(&self, symbol: &str) -> ModuleExport {
        let inner = Arc::clone(&self.inner);
        match symbol {
            symbols::CONFIG_INIT => ModuleExport::Init(Box::new(move || {
                inner.check_base();
                inner.init_calls.fetch_add(1, Ordering::SeqCst);
            })),
            symbols::CONFIG_RUN => ModuleExport::Cycle(Box::new(move |tick| {
                inner.check_base();
                if inner.in_accessor.load(Ordering::SeqCst) {
                    inner.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                inner.in_cycle.store(true, Ordering::SeqCst);
                let delay = *inner.cycle_delay.lock().expect("script state poisoned");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                {
                    let mut vars = inner.vars.lock().expect("script state poisoned");
                    if let Some(script) =
                        inner.on_cycle.lock().expect("script state poisoned").as_mut()
                    {
                        script(tick, &mut vars);
                    }
                    // Forces win over whatever the cycle computed.
                    let forced = inner.forced.lock().expect("script state poisoned");
                    for (var, force) in vars.iter_mut().zip(forced.iter()) {
                        if let Some(force) = force {
                            var.clone_from(force);
                        }
                    }
                }
                inner.cycle_calls.fetch_add(1, Ordering::SeqCst);
                inner.last_tick.store(tick, Ordering::SeqCst);
                inner.in_cycle.store(false, Ordering::SeqCst);
            })),
            symbols::GET_DEBUG_VARIABLE => ModuleExport::GetVariable(Box::new(move |index| {
                inner.enter_accessor();
                let result = inner
                    .vars
                    .lock()
                    .expect("script state poisoned")
                    .get(index as usize)
                    .cloned()
                    .ok_or(VariableFault::OutOfRange);
                inner.exit_accessor();
                result
            })),
            symbols::SET_TRACE => ModuleExport::SetTrace(Box::new(move |index, forced, force| {
                inner.enter_accessor();
                inner
                    .traced
                    .lock()
                    .expect("script state poisoned")
                    .push(index);
                if forced {
                    if let Some(slot) = inner
                        .forced
                        .lock()
                        .expect("script state poisoned")
                        .get_mut(index as usize)
                    {
                        *slot = force.map(<[u8]>::to_vec);
                    }
                }
                inner.exit_accessor();
            })),
            symbols::TRACE_RESET => ModuleExport::ResetTrace(Box::new(move || {
                inner.enter_accessor();
                inner.traced.lock().expect("script state poisoned").clear();
                inner.exit_accessor();
            })),
            symbols::FORCE_VAR => ModuleExport::Force(Box::new(move |index, forced, value| {
                inner.enter_accessor();
                if let Some(slot) = inner
                    .forced
                    .lock()
                    .expect("script state poisoned")
                    .get_mut(index as usize)
                {
                    *slot = forced.then(|| value.to_vec());
                }
                inner.exit_accessor();
            })),
            symbols::REGISTER_DEBUG_VARIABLE => {
                ModuleExport::Register(Box::new(move |index| {
                    inner.check_base();
                    let count = inner.vars.lock().expect("script state poisoned").len();
                    if (index as usize) < count {
                        Ok(())
                    } else {
                        Err(VariableFault::OutOfRange)
                    }
                }))
            }
            symbols::COMMON_TICKTIME => {
                let nanos = u64::try_from(self.inner.period.as_nanos()).unwrap_or(u64::MAX);
                ModuleExport::TickPeriod(nanos)
            }
            _ => unreachable!("unknown symbol filtered by export()"),
        }
    }
}

impl BoundImage for ScriptedImage {
    fn name(&self) -> SmolStr {
        self.inner.name.clone()
    }

    fn exec_base(&self) -> ExecBase {
        ExecBase(self.inner.base)
    }

    fn base_slot(&self) -> BaseSlot {
        self.inner.slot.clone()
    }

    fn export(&self, symbol: &str) -> Option<ModuleExport> {
        const KNOWN: [&str; 8] = [
            symbols::CONFIG_INIT,
            symbols::CONFIG_RUN,
            symbols::GET_DEBUG_VARIABLE,
            symbols::SET_TRACE,
            symbols::TRACE_RESET,
            symbols::FORCE_VAR,
            symbols::REGISTER_DEBUG_VARIABLE,
            symbols::COMMON_TICKTIME,
        ];
        if !KNOWN.contains(&symbol) || self.inner.omitted.contains(&symbol) {
            return None;
        }
        Some(self.exports(symbol))
    }
}

/// Binds payloads whose bytes name a registered [`ScriptedModule`].
#[derive(Default)]
pub struct ScriptedLinker {
    scripts: Mutex<IndexMap<SmolStr, ScriptedModule>>,
    /// External references every bind resolves, to exercise the
    /// resolver the way a real image would.
    externs: Vec<SmolStr>,
}

impl ScriptedLinker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `names` to resolve on every bind.
    #[must_use]
    pub fn with_externs(mut self, names: &[&str]) -> Self {
        self.externs = names.iter().copied().map(SmolStr::new).collect();
        self
    }

    pub fn register(&self, module: ScriptedModule) {
        self.scripts
            .lock()
            .expect("linker registry poisoned")
            .insert(module.name().clone(), module);
    }

    fn payload_of(source: &LinkSource) -> Result<Vec<u8>, LinkError> {
        match source {
            LinkSource::Copied(payload) => Ok(payload.clone()),
            LinkSource::InPlace(flash) => {
                // Execute-in-place: read the payload straight from the
                // partition, trimming the erased tail.
                let size = flash.size();
                if size <= HEADER_SIZE {
                    return Err(LinkError::MalformedImage("partition too small".into()));
                }
                let mut bytes = vec![0u8; size];
                flash
                    .read(0, &mut bytes)
                    .map_err(|err| LinkError::MalformedImage(err.to_string().into()))?;
                let payload = ImageHeader::payload(&bytes)
                    .map_err(|err| LinkError::MalformedImage(err.to_string().into()))?;
                let end = payload
                    .iter()
                    .rposition(|&byte| byte != 0xFF)
                    .map_or(0, |pos| pos + 1);
                Ok(payload[..end].to_vec())
            }
        }
    }
}

impl ModuleLinker for ScriptedLinker {
    fn bind(
        &self,
        source: LinkSource,
        resolver: &SymbolResolver,
    ) -> Result<Box<dyn BoundImage>, LinkError> {
        for name in &self.externs {
            if resolver.resolve(name).is_none() {
                return Err(LinkError::UnresolvedExtern(name.clone()));
            }
        }
        let payload = Self::payload_of(&source)?;
        let name = std::str::from_utf8(&payload)
            .map_err(|_| LinkError::MalformedImage("payload is not a module name".into()))?;
        let script = self
            .scripts
            .lock()
            .expect("linker registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LinkError::MalformedImage(format!("unknown module '{name}'").into()))?;
        Ok(Box::new(ScriptedImage {
            inner: script.inner,
        }))
    }
}

/// A sealed image whose payload is the module name.
#[must_use]
pub fn sealed_image(name: &str) -> Vec<u8> {
    let payload = name.as_bytes();
    let mut image = ImageHeader::seal(payload).to_vec();
    image.extend_from_slice(payload);
    image
}
