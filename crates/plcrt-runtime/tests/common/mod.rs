#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use plcrt_runtime::flash::MemFlash;
use plcrt_runtime::harness::{sealed_image, ScriptedLinker, ScriptedModule};
use plcrt_runtime::io::LoopbackIoDriver;
use plcrt_runtime::{LoadSource, Runtime, RuntimeConfig};

/// Short cycle period so tests finish quickly.
pub const PERIOD: Duration = Duration::from_millis(2);

pub fn temp_file(prefix: &str, contents: &[u8]) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("plcrt-{prefix}-{nanos}.bin"));
    std::fs::write(&path, contents).expect("write temp file");
    path
}

pub struct TestRig {
    pub runtime: Runtime,
    pub module: ScriptedModule,
    pub image_path: PathBuf,
}

impl TestRig {
    pub fn load_staged(&self) {
        self.runtime
            .load(&LoadSource::Staged(self.image_path.clone()))
            .expect("load staged module");
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.image_path);
    }
}

/// A runtime wired to a scripted linker knowing `module`, a loopback
/// I/O driver and an in-memory flash partition.
pub fn rig_with(config: RuntimeConfig, module: ScriptedModule) -> TestRig {
    let linker = Arc::new(ScriptedLinker::new());
    linker.register(module.clone());
    let flash = Arc::new(MemFlash::new(256 * 1024));
    let runtime = Runtime::new(config, linker, Box::new(LoopbackIoDriver), flash)
        .expect("build runtime");
    let image_path = temp_file(module.name().as_str(), &sealed_image(module.name().as_str()));
    TestRig {
        runtime,
        module,
        image_path,
    }
}

pub fn rig(module: ScriptedModule) -> TestRig {
    rig_with(RuntimeConfig::default(), module)
}

/// A module with two variables of 4 and 1 bytes.
pub fn two_var_module(name: &str) -> ScriptedModule {
    ScriptedModule::new(name, PERIOD, vec![vec![0; 4], vec![0]])
}

/// Poll `predicate` every millisecond until it holds or `timeout`
/// expires.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    predicate()
}
