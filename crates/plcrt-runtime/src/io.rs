//! Process image and the I/O driver seam.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Point counts for the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoLayout {
    /// Discrete inputs (`IX`).
    pub discrete_inputs: usize,
    /// Output coils (`QX`).
    pub coils: usize,
    /// Input words (`IW`).
    pub input_words: usize,
    /// Holding words (`QW`).
    pub holding_words: usize,
}

impl Default for IoLayout {
    fn default() -> Self {
        Self {
            discrete_inputs: 16,
            coils: 16,
            input_words: 8,
            holding_words: 16,
        }
    }
}

/// The module-visible snapshot of all I/O points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImage {
    pub ix: Vec<bool>,
    pub qx: Vec<bool>,
    pub iw: Vec<u16>,
    pub qw: Vec<u16>,
}

impl ProcessImage {
    #[must_use]
    pub fn new(layout: IoLayout) -> Self {
        Self {
            ix: vec![false; layout.discrete_inputs],
            qx: vec![false; layout.coils],
            iw: vec![0; layout.input_words],
            qw: vec![0; layout.holding_words],
        }
    }

    /// Zero every point.
    pub fn reset(&mut self) {
        self.ix.fill(false);
        self.qx.fill(false);
        self.iw.fill(0);
        self.qw.fill(0);
    }

    /// Drive all outputs to their inactive state. Inputs are left
    /// untouched.
    pub fn set_outputs_safe(&mut self) {
        self.qx.fill(false);
        self.qw.fill(0);
    }
}

/// Shared handle to the process image. The cycle task, the resolver's
/// output-bit bindings and status displays all go through this lock.
#[derive(Debug, Clone)]
pub struct SharedProcessImage {
    inner: Arc<Mutex<ProcessImage>>,
}

impl SharedProcessImage {
    #[must_use]
    pub fn new(layout: IoLayout) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProcessImage::new(layout))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcessImage> {
        self.inner.lock().expect("process image poisoned")
    }

    /// Read one coil, clamped to `false` past the configured layout.
    #[must_use]
    pub fn coil(&self, index: usize) -> bool {
        self.lock().qx.get(index).copied().unwrap_or(false)
    }

    /// Write one coil; out-of-layout writes are dropped.
    pub fn set_coil(&self, index: usize, value: bool) {
        if let Some(bit) = self.lock().qx.get_mut(index) {
            *bit = value;
        }
    }
}

/// Hardware seam. Implementations map the process image onto real
/// peripherals; the runtime itself never touches pins.
pub trait IoDriver: Send {
    /// Refresh `IX`/`IW` from the field, before the cycle runs.
    fn read_inputs(&mut self, image: &mut ProcessImage);
    /// Apply `QX`/`QW` to the field, after the cycle runs.
    fn write_outputs(&mut self, image: &ProcessImage);
}

/// Development driver that wires outputs straight back to inputs.
#[derive(Debug, Default)]
pub struct LoopbackIoDriver;

impl IoDriver for LoopbackIoDriver {
    fn read_inputs(&mut self, image: &mut ProcessImage) {
        for (input, coil) in image.ix.iter_mut().zip(&image.qx) {
            *input = *coil;
        }
        for (input, word) in image.iw.iter_mut().zip(&image.qw) {
            *input = *word;
        }
    }

    fn write_outputs(&mut self, _image: &ProcessImage) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_state_clears_outputs_only() {
        let mut image = ProcessImage::new(IoLayout::default());
        image.ix[0] = true;
        image.qx[3] = true;
        image.qw[2] = 77;
        image.set_outputs_safe();
        assert!(image.ix[0]);
        assert!(!image.qx[3]);
        assert_eq!(image.qw[2], 0);
    }

    #[test]
    fn loopback_reflects_coils() {
        let mut image = ProcessImage::new(IoLayout::default());
        image.qx[1] = true;
        image.qw[0] = 42;
        LoopbackIoDriver.read_inputs(&mut image);
        assert!(image.ix[1]);
        assert_eq!(image.iw[0], 42);
    }

    #[test]
    fn shared_coil_access_is_bounds_checked() {
        let shared = SharedProcessImage::new(IoLayout::default());
        shared.set_coil(2, true);
        shared.set_coil(999, true);
        assert!(shared.coil(2));
        assert!(!shared.coil(999));
    }
}
