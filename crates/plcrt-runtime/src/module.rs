//! Module ABI: exported symbols, entry points and execution context.
//!
//! Loaded modules are position independent and address their own data
//! region relative to a base pointer. The base must be installed into
//! the shared [`BaseSlot`] immediately before **every** call into
//! module code; intervening code may overwrite it, so the install is
//! never sticky. All call paths go through [`LoadedModule`] so the
//! contract lives in one place.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;
use thiserror::Error;

use crate::error::RuntimeError;
use crate::flash::FlashRegion;
use crate::resolver::SymbolResolver;

/// Exported symbol names. The names are a compatibility contract with
/// the module build tooling and must not change.
pub mod symbols {
    pub const CONFIG_INIT: &str = "config_init__";
    pub const CONFIG_RUN: &str = "config_run__";
    pub const GET_DEBUG_VARIABLE: &str = "GetDebugVariable";
    pub const REGISTER_DEBUG_VARIABLE: &str = "RegisterDebugVariable";
    pub const FORCE_VAR: &str = "force_var";
    pub const SET_TRACE: &str = "set_trace";
    pub const TRACE_RESET: &str = "trace_reset";
    pub const COMMON_TICKTIME: &str = "common_ticktime__";
}

/// Link-time errors reported by a [`ModuleLinker`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("malformed module image: {0}")]
    MalformedImage(SmolStr),
    #[error("unresolved external symbol '{0}'")]
    UnresolvedExtern(SmolStr),
}

/// Variable accessor faults, mirroring the module-side return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VariableFault {
    /// The variable has no value or size available.
    #[error("variable value unavailable")]
    Unavailable,
    /// The index is outside the module's debug variable table.
    #[error("variable index out of range")]
    OutOfRange,
}

/// How the module image was bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// The whole payload was copied into loader-owned memory.
    CopyAll,
    /// The payload executes in place from the flash region.
    ExecuteInPlace,
}

/// Where the payload bytes live while bound.
pub enum LinkSource {
    Copied(Vec<u8>),
    InPlace(Arc<dyn FlashRegion>),
}

impl LinkSource {
    #[must_use]
    pub fn mode(&self) -> LoadMode {
        match self {
            Self::Copied(_) => LoadMode::CopyAll,
            Self::InPlace(_) => LoadMode::ExecuteInPlace,
        }
    }
}

/// Data-region base address of a bound image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecBase(pub u32);

/// The shared base-pointer slot module code reads for relative
/// addressing. Cleared on guard drop so a missing re-install is caught
/// rather than silently reusing a stale base.
#[derive(Debug, Clone, Default)]
pub struct BaseSlot {
    inner: Arc<AtomicU32>,
}

impl BaseSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::SeqCst)
    }

    fn install(&self, base: ExecBase) {
        self.inner.store(base.0, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.inner.store(0, Ordering::SeqCst);
    }
}

/// Scoped installer for the module execution context.
pub struct ExecGuard<'a> {
    slot: &'a BaseSlot,
}

impl<'a> ExecGuard<'a> {
    fn enter(slot: &'a BaseSlot, base: ExecBase) -> Self {
        slot.install(base);
        Self { slot }
    }
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

pub type InitFn = Box<dyn Fn() + Send + Sync>;
pub type CycleFn = Box<dyn Fn(u32) + Send + Sync>;
pub type GetVariableFn = Box<dyn Fn(u32) -> Result<Vec<u8>, VariableFault> + Send + Sync>;
pub type SetTraceFn = Box<dyn Fn(u32, bool, Option<&[u8]>) + Send + Sync>;
pub type ForceFn = Box<dyn Fn(u32, bool, &[u8]) + Send + Sync>;
pub type ResetTraceFn = Box<dyn Fn() + Send + Sync>;
pub type RegisterFn = Box<dyn Fn(u32) -> Result<(), VariableFault> + Send + Sync>;

/// One export of a bound image. Closed set: there is exactly one
/// variant per entry point category plus the declared tick period
/// datum.
pub enum ModuleExport {
    Init(InitFn),
    Cycle(CycleFn),
    GetVariable(GetVariableFn),
    SetTrace(SetTraceFn),
    Force(ForceFn),
    ResetTrace(ResetTraceFn),
    Register(RegisterFn),
    /// Declared cycle period in nanoseconds (`common_ticktime__`).
    TickPeriod(u64),
}

/// A relocated, bound module image produced by a [`ModuleLinker`].
pub trait BoundImage: Send + Sync {
    /// Module name embedded in the image.
    fn name(&self) -> SmolStr;
    /// Base address of the image's data region.
    fn exec_base(&self) -> ExecBase;
    /// The base-pointer slot this image reads.
    fn base_slot(&self) -> BaseSlot;
    /// Look up one export by symbol name.
    fn export(&self, symbol: &str) -> Option<ModuleExport>;
}

/// Binds an externally-produced position-independent image. The
/// relocation format itself is out of scope; implementations resolve
/// the image's external references through the supplied resolver.
pub trait ModuleLinker: Send + Sync {
    fn bind(
        &self,
        source: LinkSource,
        resolver: &SymbolResolver,
    ) -> Result<Box<dyn BoundImage>, LinkError>;
}

/// One bound, executing control program.
pub struct LoadedModule {
    name: SmolStr,
    mode: LoadMode,
    slot: BaseSlot,
    base: ExecBase,
    period: Duration,
    init: InitFn,
    cycle: CycleFn,
    get_variable: GetVariableFn,
    set_trace: SetTraceFn,
    reset_trace: ResetTraceFn,
    force: Option<ForceFn>,
    register: Option<RegisterFn>,
    // Keeps the backing image memory alive for the module's lifetime.
    _image: Box<dyn BoundImage>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("period", &self.period)
            .field("force", &self.force.is_some())
            .finish()
    }
}

impl LoadedModule {
    /// Resolve the fixed entry-point set from a bound image.
    ///
    /// All required symbols must be present with the expected shape;
    /// otherwise the whole bind fails and nothing is kept. The two
    /// optional entry points merely disable their capability when
    /// absent.
    pub fn bind(image: Box<dyn BoundImage>, mode: LoadMode) -> Result<Self, RuntimeError> {
        fn missing(name: &str) -> RuntimeError {
            RuntimeError::SymbolResolutionFailure(name.into())
        }

        let init = match image.export(symbols::CONFIG_INIT) {
            Some(ModuleExport::Init(f)) => f,
            _ => return Err(missing(symbols::CONFIG_INIT)),
        };
        let cycle = match image.export(symbols::CONFIG_RUN) {
            Some(ModuleExport::Cycle(f)) => f,
            _ => return Err(missing(symbols::CONFIG_RUN)),
        };
        let get_variable = match image.export(symbols::GET_DEBUG_VARIABLE) {
            Some(ModuleExport::GetVariable(f)) => f,
            _ => return Err(missing(symbols::GET_DEBUG_VARIABLE)),
        };
        let set_trace = match image.export(symbols::SET_TRACE) {
            Some(ModuleExport::SetTrace(f)) => f,
            _ => return Err(missing(symbols::SET_TRACE)),
        };
        let reset_trace = match image.export(symbols::TRACE_RESET) {
            Some(ModuleExport::ResetTrace(f)) => f,
            _ => return Err(missing(symbols::TRACE_RESET)),
        };
        let period_ns = match image.export(symbols::COMMON_TICKTIME) {
            Some(ModuleExport::TickPeriod(ns)) => ns,
            _ => return Err(missing(symbols::COMMON_TICKTIME)),
        };
        let force = match image.export(symbols::FORCE_VAR) {
            Some(ModuleExport::Force(f)) => Some(f),
            _ => None,
        };
        let register = match image.export(symbols::REGISTER_DEBUG_VARIABLE) {
            Some(ModuleExport::Register(f)) => Some(f),
            _ => None,
        };

        if period_ns == 0 {
            tracing::warn!(module = %image.name(), "module declares a zero cycle period");
        }

        Ok(Self {
            name: image.name(),
            mode,
            slot: image.base_slot(),
            base: image.exec_base(),
            period: Duration::from_nanos(period_ns),
            init,
            cycle,
            get_variable,
            set_trace,
            reset_trace,
            force,
            register,
            _image: image,
        })
    }

    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    #[must_use]
    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    /// Declared cycle period (`common_ticktime__`).
    #[must_use]
    pub fn cycle_period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn supports_force(&self) -> bool {
        self.force.is_some()
    }

    #[must_use]
    pub fn supports_register(&self) -> bool {
        self.register.is_some()
    }

    fn enter(&self) -> ExecGuard<'_> {
        ExecGuard::enter(&self.slot, self.base)
    }

    /// Run the module initializer.
    pub fn init(&self) {
        let _ctx = self.enter();
        (self.init)();
    }

    /// Run one control cycle.
    pub fn run_cycle(&self, tick: u32) {
        let _ctx = self.enter();
        (self.cycle)(tick);
    }

    /// Read a debug variable's current raw bytes.
    pub fn get_variable(&self, index: u32) -> Result<Vec<u8>, VariableFault> {
        let _ctx = self.enter();
        (self.get_variable)(index)
    }

    /// Add or remove a variable from the module-side trace set.
    pub fn set_trace(&self, index: u32, forced: bool, force: Option<&[u8]>) {
        let _ctx = self.enter();
        (self.set_trace)(index, forced, force);
    }

    /// Clear the module-side trace set.
    pub fn reset_trace(&self) {
        let _ctx = self.enter();
        (self.reset_trace)();
    }

    /// Override a variable's computed value.
    pub fn force_variable(&self, index: u32, forced: bool, value: &[u8]) -> Result<(), RuntimeError> {
        let force = self.force.as_ref().ok_or(RuntimeError::ForceUnsupported)?;
        let _ctx = self.enter();
        force(index, forced, value);
        Ok(())
    }

    /// Register a debug variable. The entry point is optional; when the
    /// module does not export it this is a no-op.
    pub fn register_variable(&self, index: u32) -> Result<(), RuntimeError> {
        let Some(register) = self.register.as_ref() else {
            return Ok(());
        };
        let _ctx = self.enter();
        register(index).map_err(|_| RuntimeError::VariableQuery { index })
    }
}
