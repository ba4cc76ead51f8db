//! External symbol resolution for module binding.
//!
//! A module image carries external references by name. The set of
//! names the host satisfies is fixed; anything else fails the bind.
//! Resolution happens once, during [`crate::module::ModuleLinker::bind`],
//! never per call.

#![allow(missing_docs)]

use smol_str::SmolStr;

use crate::io::SharedProcessImage;
use crate::rtelog::{LogLevel, RteLog};
use crate::time::ClockCell;

/// Number of `__QX0_0_n` output-bit cells exposed to modules.
pub const OUTPUT_BITS: usize = 8;

/// Primitive operations satisfied inside the bound image itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Printf,
    Puts,
    Putchar,
    Memcpy,
    Memset,
}

/// One output coil exposed to module code as a named cell.
#[derive(Debug, Clone)]
pub struct OutputBitCell {
    image: SharedProcessImage,
    index: usize,
}

impl OutputBitCell {
    #[must_use]
    pub fn get(&self) -> bool {
        self.image.coil(self.index)
    }

    pub fn set(&self, value: bool) {
        self.image.set_coil(self.index, value);
    }
}

/// Callback type for the module-side log hooks.
pub type LogFn = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// What a resolved external name binds to.
pub enum HostBinding {
    /// Libc-like primitive, handled by the linker internally.
    Intrinsic(Intrinsic),
    /// `LogMessage` / `rte_log_inf` sink into the RTE message log.
    Log(LogFn),
    /// The shared logical clock (`__CURRENT_TIME`).
    CurrentTime(ClockCell),
    /// One `__QX0_0_n` coil.
    OutputBit(OutputBitCell),
}

impl std::fmt::Debug for HostBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intrinsic(op) => f.debug_tuple("Intrinsic").field(op).finish(),
            Self::Log(_) => f.write_str("Log"),
            Self::CurrentTime(_) => f.write_str("CurrentTime"),
            Self::OutputBit(cell) => f.debug_tuple("OutputBit").field(&cell.index).finish(),
        }
    }
}

/// Fixed name-to-binding table consulted at bind time.
#[derive(Debug, Clone)]
pub struct SymbolResolver {
    clock: ClockCell,
    image: SharedProcessImage,
    log: RteLog,
}

impl SymbolResolver {
    #[must_use]
    pub fn new(clock: ClockCell, image: SharedProcessImage, log: RteLog) -> Self {
        Self { clock, image, log }
    }

    /// Resolve one external reference. `None` means the bind must fail;
    /// the caller reports the missing name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<HostBinding> {
        let binding = match name {
            "printf" => HostBinding::Intrinsic(Intrinsic::Printf),
            "puts" => HostBinding::Intrinsic(Intrinsic::Puts),
            "putchar" => HostBinding::Intrinsic(Intrinsic::Putchar),
            "memcpy" => HostBinding::Intrinsic(Intrinsic::Memcpy),
            "memset" => HostBinding::Intrinsic(Intrinsic::Memset),
            "LogMessage" => {
                let log = self.log.clone();
                HostBinding::Log(Box::new(move |level, text| log.log(level, text)))
            }
            // Module-side convenience wrapper, always info level.
            "rte_log_inf" => {
                let log = self.log.clone();
                HostBinding::Log(Box::new(move |_level, text| log.log(LogLevel::Info, text)))
            }
            "__CURRENT_TIME" => HostBinding::CurrentTime(self.clock.clone()),
            _ => return self.resolve_output_bit(name),
        };
        Some(binding)
    }

    fn resolve_output_bit(&self, name: &str) -> Option<HostBinding> {
        let suffix = name.strip_prefix("__QX0_0_")?;
        let index: usize = suffix.parse().ok()?;
        if index >= OUTPUT_BITS {
            return None;
        }
        Some(HostBinding::OutputBit(OutputBitCell {
            image: self.image.clone(),
            index,
        }))
    }

    /// Names this resolver satisfies, for diagnostics.
    #[must_use]
    pub fn known_symbols(&self) -> Vec<SmolStr> {
        let mut names: Vec<SmolStr> = [
            "printf",
            "puts",
            "putchar",
            "memcpy",
            "memset",
            "LogMessage",
            "rte_log_inf",
            "__CURRENT_TIME",
        ]
        .into_iter()
        .map(SmolStr::new)
        .collect();
        for bit in 0..OUTPUT_BITS {
            names.push(SmolStr::new(format!("__QX0_0_{bit}")));
        }
        names
    }
}
