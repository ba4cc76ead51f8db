mod common;

use std::sync::Arc;

use plcrt_runtime::error::RuntimeError;
use plcrt_runtime::flash::MemFlash;
use plcrt_runtime::harness::{sealed_image, ScriptedLinker};
use plcrt_runtime::image::ImageError;
use plcrt_runtime::io::LoopbackIoDriver;
use plcrt_runtime::module::{symbols, LinkError, LoadMode};
use plcrt_runtime::{LoadSource, PlcStatus, Runtime, RuntimeConfig};

use common::{rig, rig_with, temp_file, two_var_module, wait_until, PERIOD};

#[test]
fn staged_load_transitions_empty_to_stopped() {
    let rig = rig(two_var_module("basic"));
    assert_eq!(rig.runtime.status(), PlcStatus::Empty);
    rig.load_staged();
    assert_eq!(rig.runtime.status(), PlcStatus::Stopped);
    assert_eq!(rig.runtime.module_name().as_deref(), Some("basic"));
    assert_eq!(rig.runtime.module_mode(), Some(LoadMode::CopyAll));
    assert_eq!(rig.runtime.module_period(), Some(PERIOD));
}

#[test]
fn tampered_image_is_rejected_and_prior_module_survives() {
    let rig = rig(two_var_module("survivor"));
    rig.load_staged();

    let mut image = sealed_image("survivor");
    let last = image.len() - 1;
    image[last] ^= 0xA5;
    let tampered = temp_file("tampered", &image);
    let err = rig.runtime.load(&LoadSource::Staged(tampered.clone()));
    assert!(matches!(
        err,
        Err(RuntimeError::IntegrityFailure(
            ImageError::ChecksumMismatch { .. }
        ))
    ));
    // The previously bound module is untouched.
    assert_eq!(rig.runtime.module_name().as_deref(), Some("survivor"));
    assert_eq!(rig.runtime.status(), PlcStatus::Stopped);
    let _ = std::fs::remove_file(tampered);
}

#[test]
fn oversized_image_is_rejected_before_validation() {
    let config = RuntimeConfig {
        staging_capacity: 16,
        ..RuntimeConfig::default()
    };
    let rig = rig_with(config, two_var_module("a-module-with-a-long-name"));
    let err = rig.runtime.load(&LoadSource::Staged(rig.image_path.clone()));
    assert!(matches!(err, Err(RuntimeError::ImageTooLarge { capacity: 16, .. })));
    assert_eq!(rig.runtime.status(), PlcStatus::Empty);
}

#[test]
fn missing_required_symbol_fails_the_whole_bind() {
    let module =
        two_var_module("incomplete").without_symbol(symbols::GET_DEBUG_VARIABLE);
    let rig = rig(module);
    let err = rig.runtime.load(&LoadSource::Staged(rig.image_path.clone()));
    assert_eq!(
        err,
        Err(RuntimeError::SymbolResolutionFailure(
            symbols::GET_DEBUG_VARIABLE.into()
        ))
    );
    assert_eq!(rig.runtime.status(), PlcStatus::Empty);
}

#[test]
fn missing_optional_symbol_only_disables_the_capability() {
    let module = two_var_module("no-force").without_symbol(symbols::FORCE_VAR);
    let rig = rig(module);
    rig.load_staged();
    assert_eq!(
        rig.runtime.force_variable(0, Some(&[1, 2, 3, 4])),
        Err(RuntimeError::ForceUnsupported)
    );
}

#[test]
fn unresolved_extern_fails_the_bind() {
    let module = two_var_module("needs-dlopen");
    let linker = Arc::new(ScriptedLinker::new().with_externs(&["dlopen"]));
    linker.register(module.clone());
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        linker,
        Box::new(LoopbackIoDriver),
        Arc::new(MemFlash::new(4096)),
    )
    .expect("build runtime");
    let image = temp_file("externs", &sealed_image("needs-dlopen"));
    let err = runtime.load(&LoadSource::Staged(image.clone()));
    assert_eq!(
        err,
        Err(RuntimeError::Link(LinkError::UnresolvedExtern(
            "dlopen".into()
        )))
    );
    let _ = std::fs::remove_file(image);
}

#[test]
fn load_and_unload_are_refused_while_started() {
    let rig = rig(two_var_module("busy"));
    rig.load_staged();
    rig.runtime.start();
    assert!(wait_until(std::time::Duration::from_secs(1), || {
        rig.module.cycle_calls() > 0
    }));

    assert!(matches!(
        rig.runtime.load(&LoadSource::Staged(rig.image_path.clone())),
        Err(RuntimeError::PermissionDenied(_))
    ));
    assert!(matches!(
        rig.runtime.unload(),
        Err(RuntimeError::PermissionDenied(_))
    ));

    rig.runtime.stop();
    rig.runtime.unload().expect("unload while stopped");
    assert_eq!(rig.runtime.status(), PlcStatus::Empty);
    assert_eq!(rig.runtime.unload(), Err(RuntimeError::NoModuleLoaded));
}

#[test]
fn start_with_nothing_loaded_is_a_no_op() {
    let rig = rig(two_var_module("idle"));
    rig.runtime.start();
    assert_eq!(rig.runtime.status(), PlcStatus::Empty);
}

#[test]
fn flash_load_executes_in_place_after_magic_check() {
    let module = two_var_module("xip");
    let linker = Arc::new(ScriptedLinker::new());
    linker.register(module.clone());
    let flash = Arc::new(MemFlash::with_image(4096, &sealed_image("xip")));
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        linker,
        Box::new(LoopbackIoDriver),
        flash,
    )
    .expect("build runtime");

    runtime.load(&LoadSource::Flash).expect("load from flash");
    assert_eq!(runtime.module_mode(), Some(LoadMode::ExecuteInPlace));
    assert_eq!(runtime.module_name().as_deref(), Some("xip"));
}

#[test]
fn blank_flash_is_rejected_by_the_magic_check() {
    let module = two_var_module("blank");
    let linker = Arc::new(ScriptedLinker::new());
    linker.register(module);
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        linker,
        Box::new(LoopbackIoDriver),
        Arc::new(MemFlash::new(4096)),
    )
    .expect("build runtime");
    assert!(matches!(
        runtime.load(&LoadSource::Flash),
        Err(RuntimeError::IntegrityFailure(ImageError::BadMagic))
    ));
}

#[test]
fn flash_module_streams_and_validates_the_image() {
    let module = two_var_module("flashed");
    let linker = Arc::new(ScriptedLinker::new());
    linker.register(module.clone());
    let flash = Arc::new(MemFlash::new(4096));
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        linker,
        Box::new(LoopbackIoDriver),
        flash,
    )
    .expect("build runtime");

    let image = temp_file("flash-src", &sealed_image("flashed"));
    runtime.flash_module(&image).expect("program flash");
    runtime.load(&LoadSource::Flash).expect("load programmed module");
    assert_eq!(runtime.module_mode(), Some(LoadMode::ExecuteInPlace));

    // A corrupted source file fails the streamed CRC check.
    let mut bad = sealed_image("flashed");
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    let bad_path = temp_file("flash-bad", &bad);
    // The bound module executes in place, so programming stops and
    // unloads it first.
    let err = runtime.flash_module(&bad_path);
    assert!(matches!(
        err,
        Err(RuntimeError::IntegrityFailure(
            ImageError::ChecksumMismatch { .. }
        ))
    ));
    assert_eq!(runtime.status(), PlcStatus::Empty);

    let _ = std::fs::remove_file(image);
    let _ = std::fs::remove_file(bad_path);
}

#[test]
fn erase_flash_stops_unloads_and_blanks_the_partition() {
    let module = two_var_module("erased");
    let linker = Arc::new(ScriptedLinker::new());
    linker.register(module.clone());
    let flash = Arc::new(MemFlash::with_image(4096, &sealed_image("erased")));
    let runtime = Runtime::new(
        RuntimeConfig::default(),
        linker,
        Box::new(LoopbackIoDriver),
        Arc::clone(&flash) as Arc<dyn plcrt_runtime::flash::FlashRegion>,
    )
    .expect("build runtime");

    runtime.load(&LoadSource::Flash).expect("load from flash");
    runtime.start();
    assert!(wait_until(std::time::Duration::from_secs(1), || {
        module.cycle_calls() > 0
    }));

    runtime.erase_flash(false).expect("erase");
    assert_eq!(runtime.status(), PlcStatus::Empty);
    assert!(matches!(
        runtime.load(&LoadSource::Flash),
        Err(RuntimeError::IntegrityFailure(ImageError::BadMagic))
    ));
}
