//! The runtime aggregate tying loader, scheduler and trace together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::flash::FlashRegion;
use crate::io::{IoDriver, SharedProcessImage};
use crate::loader::{LoadSource, ModuleLoader};
use crate::module::{LoadMode, ModuleLinker};
use crate::resolver::SymbolResolver;
use crate::rtelog::RteLog;
use crate::scheduler::{CycleCore, CycleScheduler, CycleTiming, PlcStatus};
use crate::time::ClockCell;
use crate::trace::{FetchBatch, SessionToken, TraceEngine, TraceHandle, TraceOrder};

/// One PLC runtime instance: module slot, cycle thread, trace engine,
/// process image and RTE log. All collaborator surfaces go through
/// here; there is no free-standing global state.
pub struct Runtime {
    config: RuntimeConfig,
    loader: ModuleLoader,
    scheduler: CycleScheduler,
    trace: TraceEngine,
    core: Arc<CycleCore>,
    image: SharedProcessImage,
    rte_log: RteLog,
}

impl Runtime {
    /// Build a runtime from its collaborators. The cycle thread is
    /// spawned immediately and idles until `start`.
    pub fn new(
        config: RuntimeConfig,
        linker: Arc<dyn ModuleLinker>,
        driver: Box<dyn IoDriver>,
        flash: Arc<dyn FlashRegion>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let clock = ClockCell::new();
        let image = SharedProcessImage::new(config.io);
        let rte_log = RteLog::new(config.rte_log_retain);
        let resolver = SymbolResolver::new(clock.clone(), image.clone(), rte_log.clone());
        let core = Arc::new(CycleCore::new(
            config.tick_modulus,
            clock,
            image.clone(),
            driver,
        ));
        let trace = TraceEngine::new(
            Arc::clone(&core),
            config.ring_capacity,
            config.max_traced,
            config.session_timeout(),
            config.fetch_poll_limit(),
        );
        let scheduler = CycleScheduler::spawn(Arc::clone(&core), trace.lifecycle())?;
        let loader = ModuleLoader::new(config.staging_capacity, linker, resolver, flash);
        Ok(Self {
            config,
            loader,
            scheduler,
            trace,
            core,
            image,
            rte_log,
        })
    }

    /// Validate, bind and install a module. Refused while started; on
    /// any failure the previously bound module stays untouched.
    pub fn load(&self, source: &LoadSource) -> Result<(), RuntimeError> {
        if self.core.is_running() {
            return Err(RuntimeError::PermissionDenied(
                "cannot load while started".into(),
            ));
        }
        let module = self.loader.load(source)?;
        self.scheduler.bind_module(module)
    }

    /// Release the bound module. Refused while started.
    pub fn unload(&self) -> Result<(), RuntimeError> {
        self.scheduler.unbind_module()
    }

    /// Begin cyclic execution (warned no-op when already started or
    /// nothing is loaded).
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop cyclic execution, waiting (bounded) for the cycle loop.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> PlcStatus {
        self.scheduler.status()
    }

    /// Last-cycle execution and idle times.
    #[must_use]
    pub fn timing(&self) -> CycleTiming {
        self.scheduler.timing()
    }

    /// The most recently executed cycle tick.
    #[must_use]
    pub fn current_tick(&self) -> u32 {
        self.scheduler.current_tick()
    }

    /// Replace the traced variable set.
    pub fn configure_trace(&self, orders: &[TraceOrder]) -> Result<TraceHandle, RuntimeError> {
        self.trace.configure(orders)
    }

    /// Drain captured trace samples for a session.
    #[must_use]
    pub fn fetch_trace(&self, token: SessionToken) -> FetchBatch {
        self.trace.fetch(token)
    }

    /// Force (or release, with `None`) one variable's value, outside
    /// of any trace session. Runs under the exclusivity token.
    pub fn force_variable(&self, index: u32, value: Option<&[u8]>) -> Result<(), RuntimeError> {
        let module = self.core.current_module().ok_or(RuntimeError::NoModuleLoaded)?;
        self.core.token.take();
        let result = module.force_variable(index, value.is_some(), value.unwrap_or_default());
        self.core.token.give();
        result
    }

    /// Name of the bound module, if any.
    #[must_use]
    pub fn module_name(&self) -> Option<SmolStr> {
        self.core.current_module().map(|module| module.name().clone())
    }

    /// Load mode of the bound module, if any.
    #[must_use]
    pub fn module_mode(&self) -> Option<LoadMode> {
        self.core.current_module().map(|module| module.mode())
    }

    /// Declared cycle period of the bound module, if any.
    #[must_use]
    pub fn module_period(&self) -> Option<Duration> {
        self.core.current_module().map(|module| module.cycle_period())
    }

    /// Program a sealed image file into the flash partition. An
    /// execute-in-place module would be pulled out from under the
    /// scheduler, so it is stopped and unloaded first.
    pub fn flash_module(&self, path: &Path) -> Result<(), RuntimeError> {
        if self.module_mode() == Some(LoadMode::ExecuteInPlace) {
            self.stop();
            self.unload()?;
        }
        self.loader.flash_module(path)
    }

    /// Stop, unload and erase the flash partition. With `purge` the
    /// staged module file is removed and the RTE log cleared too.
    pub fn erase_flash(&self, purge: bool) -> Result<(), RuntimeError> {
        self.stop();
        match self.unload() {
            Ok(()) | Err(RuntimeError::NoModuleLoaded) => {}
            Err(err) => return Err(err),
        }
        self.loader.erase_flash()?;
        if purge {
            if let Some(path) = &self.config.module_file {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::info!(path = %path.display(), "staged module removed"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(RuntimeError::storage(&err)),
                }
            }
            self.rte_log.reset();
        }
        Ok(())
    }

    /// Load and start the configured module at boot, when enabled.
    pub fn autostart(&self) -> Result<(), RuntimeError> {
        if !self.config.autostart {
            return Ok(());
        }
        let Some(path) = self.config.module_file.clone() else {
            tracing::warn!("autostart enabled but no module file configured");
            return Ok(());
        };
        self.load(&LoadSource::Staged(path))?;
        self.start();
        Ok(())
    }

    /// Module-side message log.
    #[must_use]
    pub fn rte_log(&self) -> &RteLog {
        &self.rte_log
    }

    /// Shared process image (for display layers and drivers).
    #[must_use]
    pub fn process_image(&self) -> &SharedProcessImage {
        &self.image
    }

    /// The configuration this runtime was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
