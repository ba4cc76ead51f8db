//! Bounded in-memory message log for module code.
//!
//! Modules report through the `LogMessage`/`rte_log_inf` host bindings
//! rather than the host's own `tracing` output, so their messages can
//! be collected and cleared independently of the runtime's logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use smol_str::SmolStr;

/// Module-side log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fault that stops or degrades the control program.
    Critical,
    /// Recoverable anomaly.
    Warning,
    /// Normal operational message.
    Info,
    /// Verbose diagnostic output.
    Debug,
}

impl LogLevel {
    const COUNT: usize = 4;

    fn slot(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::Warning => 1,
            Self::Info => 2,
            Self::Debug => 3,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: u32,
    text: SmolStr,
}

#[derive(Debug)]
struct LogState {
    levels: [VecDeque<Entry>; LogLevel::COUNT],
    counts: [u32; LogLevel::COUNT],
    next_id: u32,
}

/// Shared, bounded message log.
#[derive(Debug, Clone)]
pub struct RteLog {
    inner: Arc<Mutex<LogState>>,
    retain: usize,
}

impl RteLog {
    /// Create a log retaining at most `retain` messages per level.
    #[must_use]
    pub fn new(retain: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogState {
                levels: Default::default(),
                counts: [0; LogLevel::COUNT],
                next_id: 1,
            })),
            retain,
        }
    }

    /// Append a message; the oldest message at the same level is
    /// dropped once the retention bound is reached. Message ids are
    /// monotonically increasing across all levels.
    pub fn log(&self, level: LogLevel, text: &str) {
        let mut state = self.inner.lock().expect("rte log poisoned");
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        let slot = level.slot();
        state.counts[slot] = state.counts[slot].saturating_add(1);
        let queue = &mut state.levels[slot];
        if queue.len() == self.retain {
            queue.pop_front();
        }
        queue.push_back(Entry {
            id,
            text: text.into(),
        });
    }

    /// Total messages ever logged at `level` (retention does not reduce
    /// this).
    #[must_use]
    pub fn count(&self, level: LogLevel) -> u32 {
        self.inner.lock().expect("rte log poisoned").counts[level.slot()]
    }

    /// Look up a retained message by level and id.
    #[must_use]
    pub fn message(&self, level: LogLevel, id: u32) -> Option<SmolStr> {
        let state = self.inner.lock().expect("rte log poisoned");
        state.levels[level.slot()]
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.text.clone())
    }

    /// Most recent retained messages at `level`, oldest first.
    #[must_use]
    pub fn recent(&self, level: LogLevel) -> Vec<(u32, SmolStr)> {
        let state = self.inner.lock().expect("rte log poisoned");
        state.levels[level.slot()]
            .iter()
            .map(|entry| (entry.id, entry.text.clone()))
            .collect()
    }

    /// Clear all retained messages and counters.
    pub fn reset(&self) {
        let mut state = self.inner.lock().expect("rte log poisoned");
        for queue in &mut state.levels {
            queue.clear();
        }
        state.counts = [0; LogLevel::COUNT];
    }
}
