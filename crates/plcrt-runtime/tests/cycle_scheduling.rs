mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plcrt_runtime::harness::ScriptedModule;
use plcrt_runtime::{PlcStatus, RuntimeConfig};

use common::{rig, rig_with, two_var_module, wait_until, PERIOD};

#[test]
fn cycles_run_with_increasing_ticks() {
    let rig = rig(two_var_module("ticker"));
    rig.load_staged();
    rig.runtime.start();
    assert_eq!(rig.runtime.status(), PlcStatus::Started);

    assert!(wait_until(Duration::from_secs(2), || {
        rig.module.cycle_calls() >= 5
    }));
    let tick = rig.module.last_tick();
    assert!(tick >= 5, "tick {tick} after 5 cycles");
    assert_eq!(rig.module.init_calls(), 1);

    rig.runtime.stop();
    assert_eq!(rig.runtime.status(), PlcStatus::Stopped);
    let calls_at_stop = rig.module.cycle_calls();
    std::thread::sleep(4 * PERIOD);
    assert_eq!(rig.module.cycle_calls(), calls_at_stop);
}

#[test]
fn each_activation_reinitializes_the_module() {
    let rig = rig(two_var_module("restart"));
    rig.load_staged();

    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.module.cycle_calls() >= 2
    }));
    rig.runtime.stop();

    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.module.init_calls() == 2
    }));
    rig.runtime.stop();
}

#[test]
fn double_start_is_a_warned_no_op() {
    let rig = rig(two_var_module("double"));
    rig.load_staged();
    rig.runtime.start();
    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.module.cycle_calls() >= 2
    }));
    assert_eq!(rig.module.init_calls(), 1);
    rig.runtime.stop();
}

#[test]
fn ticks_wrap_at_the_configured_modulus() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let module = ScriptedModule::new("modulo", PERIOD, vec![vec![0; 4], vec![0]]).with_cycle(
        Box::new(move |tick, _vars| {
            recorder.lock().expect("recorder poisoned").push(tick);
        }),
    );
    let config = RuntimeConfig {
        tick_modulus: 3,
        ..RuntimeConfig::default()
    };
    let rig = rig_with(config, module);
    rig.load_staged();
    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().expect("recorder poisoned").len() >= 8
    }));
    rig.runtime.stop();

    let ticks = seen.lock().expect("recorder poisoned").clone();
    assert!(ticks.iter().all(|&tick| (1..=3).contains(&tick)), "{ticks:?}");
    for pair in ticks.windows(2) {
        let expected = if pair[0] == 3 { 1 } else { pair[0] + 1 };
        assert_eq!(pair[1], expected, "sequence {ticks:?}");
    }
}

#[test]
fn idle_time_is_clamped_to_zero_on_overrun() {
    let module =
        two_var_module("overrun").with_cycle_delay(PERIOD * 2);
    let rig = rig(module);
    rig.load_staged();
    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(2), || {
        rig.module.cycle_calls() >= 3
    }));
    let timing = rig.runtime.timing();
    rig.runtime.stop();

    assert_eq!(timing.slept, Duration::ZERO);
    assert!(timing.elapsed >= PERIOD * 2, "elapsed {:?}", timing.elapsed);
    // Overruns never skip cycles; they only erase the idle time.
    assert!(rig.module.cycle_calls() >= 3);
}

#[test]
fn stop_gives_up_after_the_acknowledgment_bound() {
    // One cycle takes longer than stop() is willing to wait.
    let module = two_var_module("slow-stop").with_cycle_delay(Duration::from_millis(1500));
    let rig = rig(module);
    rig.load_staged();
    rig.runtime.start();
    std::thread::sleep(Duration::from_millis(100));

    let begun = Instant::now();
    rig.runtime.stop();
    let waited = begun.elapsed();
    assert!(waited >= Duration::from_millis(900), "stop returned after {waited:?}");
    assert!(waited < Duration::from_millis(1400), "stop blocked for {waited:?}");
    // Considered stopped even though the acknowledgment never arrived.
    assert_eq!(rig.runtime.status(), PlcStatus::Stopped);

    // Let the overlong cycle drain and the loop post its late
    // acknowledgment, then check a fresh start/stop round is not
    // confused by it.
    assert!(wait_until(Duration::from_secs(3), || {
        rig.module.cycle_calls() >= 1
    }));
    std::thread::sleep(Duration::from_millis(50));
    rig.module.set_cycle_delay(Duration::ZERO);

    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.module.init_calls() == 2 && rig.module.cycle_calls() >= 3
    }));
    rig.runtime.stop();
    assert_eq!(rig.runtime.status(), PlcStatus::Stopped);
    let calls_at_stop = rig.module.cycle_calls();
    std::thread::sleep(4 * PERIOD);
    assert_eq!(rig.module.cycle_calls(), calls_at_stop);
}

#[test]
fn base_is_installed_for_every_entry_point_call() {
    let rig = rig(two_var_module("abi"));
    rig.load_staged();
    rig.runtime.start();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.module.cycle_calls() >= 5
    }));
    rig.runtime.stop();
    assert_eq!(rig.module.abi_violations(), 0);
}
