//! Flash supervisor workflow scenarios against the scripted bus and fake
//! loader executor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hidtest::exec::ExecOutput;
use hidtest::flasher::{FlashResult, FlashSupervisor};
use hidtest::protocol::CommandClient;
use hidtest::registry::DeviceRegistry;
use hidtest::test_helpers::exec::FakeExecutor;
use hidtest::test_helpers::mock_bus::{MockBus, MockMode, ScriptedDevice};

struct FlashHarness {
    executor: Arc<FakeExecutor>,
    supervisor: FlashSupervisor,
}

fn flash_harness(devices: Vec<ScriptedDevice>, tool: Option<&str>) -> FlashHarness {
    let bus = Arc::new(MockBus::new());
    for device in devices {
        bus.add_device(device);
    }
    let registry = Arc::new(DeviceRegistry::with_timing(
        bus,
        Duration::from_secs(1),
        Duration::from_millis(5),
    ));
    registry.discover();
    for record in registry.discover() {
        registry.connect(&record.serial_number);
    }

    let client = Arc::new(CommandClient::with_timeout(
        Arc::clone(&registry),
        None,
        Duration::from_millis(500),
    ));
    let executor = Arc::new(FakeExecutor::new());
    let supervisor = FlashSupervisor::with_options(
        registry,
        client,
        executor.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
        tool.map(PathBuf::from),
    );
    FlashHarness {
        executor,
        supervisor,
    }
}

fn firmware_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("firmware.uf2");
    std::fs::write(&path, [0xAAu8; 128]).unwrap();
    path
}

/// S5: happy path through all three phases with a direct-USB loader.
#[test]
fn flash_pipeline_happy_path() {
    let device = ScriptedDevice::connected("DEV001");
    device.schedule_after_bootloader_ack(&[
        (Duration::from_millis(30), MockMode::Gone),
        (Duration::from_millis(150), MockMode::Bootloader),
    ]);

    let h = flash_harness(vec![device.clone()], Some("/usr/bin/picotool"));
    let dir = tempfile::tempdir().unwrap();
    let firmware = firmware_file(&dir);

    // The loader "reboots" the device back into application mode.
    {
        let device = device.clone();
        h.executor.on_command("picotool", move |_, args| {
            assert_eq!(args[0], "load");
            assert_eq!(args[2], "--force");
            device.set_mode_after(Duration::from_millis(100), MockMode::Normal);
            Ok(ExecOutput {
                success: true,
                code: Some(0),
                stdout: "Loading firmware\n".to_string(),
                stderr: String::new(),
            })
        });
    }

    let operation = h.supervisor.flash_firmware("DEV001", &firmware);

    assert_eq!(operation.result, Some(FlashResult::Success));
    assert!(operation.error_message.is_none());

    // All three phase durations are recorded and sum within the total.
    let entry = operation.bootloader_entry_time.expect("phase 1 duration");
    let flash = operation.flash_duration.expect("phase 2 duration");
    let reconnect = operation.reconnection_time.expect("phase 3 duration");
    let total = operation.total_duration().expect("total duration");
    assert!(entry + flash + reconnect <= total + 0.1);

    // Exactly one enter-bootloader command reached the device.
    let kinds: Vec<_> = device.written_commands().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![hidtest::frame::CommandKind::EnterBootloader]);
}

/// S6: the device acknowledges but never leaves connected status.
#[test]
fn flash_bootloader_entry_fails() {
    let device = ScriptedDevice::connected("DEV001");
    // No transition plan: the device stays visible in normal mode.

    let bus = Arc::new(MockBus::new());
    bus.add_device(device);
    let registry = Arc::new(DeviceRegistry::with_timing(
        bus,
        Duration::from_secs(1),
        Duration::from_millis(5),
    ));
    registry.discover();
    registry.connect("DEV001");
    let client = Arc::new(CommandClient::with_timeout(
        Arc::clone(&registry),
        None,
        Duration::from_millis(500),
    ));
    let supervisor = FlashSupervisor::with_options(
        registry,
        client,
        Arc::new(FakeExecutor::new()),
        Duration::from_millis(700),
        Duration::from_millis(700),
        Some(PathBuf::from("/usr/bin/picotool")),
    );

    let dir = tempfile::tempdir().unwrap();
    let firmware = firmware_file(&dir);
    let operation = supervisor.flash_firmware("DEV001", &firmware);

    assert_eq!(operation.result, Some(FlashResult::BootloaderEntryFailed));
    assert_eq!(
        operation.error_message.as_deref(),
        Some("Failed to enter bootloader mode")
    );
    assert!(operation.bootloader_entry_time.is_some());
    assert!(operation.flash_duration.is_none());
    assert!(operation.reconnection_time.is_none());
}

/// The loader exiting non-zero surfaces its stderr as flash-failed.
#[test]
fn flash_loader_failure_captures_stderr() {
    let device = ScriptedDevice::connected("DEV001");
    device.schedule_after_bootloader_ack(&[
        (Duration::from_millis(30), MockMode::Gone),
        (Duration::from_millis(150), MockMode::Bootloader),
    ]);

    let h = flash_harness(vec![device], Some("/usr/bin/picotool"));
    h.executor.on_command("picotool", |_, _| {
        Ok(ExecOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: "ERROR: No accessible RP2040 devices in BOOTSEL mode\n".to_string(),
        })
    });

    let dir = tempfile::tempdir().unwrap();
    let firmware = firmware_file(&dir);
    let operation = h.supervisor.flash_firmware("DEV001", &firmware);

    assert_eq!(operation.result, Some(FlashResult::FlashFailed));
    assert!(operation
        .error_message
        .as_deref()
        .unwrap()
        .contains("No accessible RP2040 devices"));
}

/// A missing firmware image fails before the loader runs.
#[test]
fn flash_missing_firmware_fails() {
    let device = ScriptedDevice::connected("DEV001");
    device.schedule_after_bootloader_ack(&[
        (Duration::from_millis(30), MockMode::Gone),
        (Duration::from_millis(150), MockMode::Bootloader),
    ]);
    let h = flash_harness(vec![device], Some("/usr/bin/picotool"));

    let operation = h
        .supervisor
        .flash_firmware("DEV001", std::path::Path::new("/nonexistent/fw.uf2"));

    assert_eq!(operation.result, Some(FlashResult::FlashFailed));
    assert!(operation
        .error_message
        .as_deref()
        .unwrap()
        .contains("Firmware file not found"));
    // The loader was never invoked.
    assert!(h
        .executor
        .calls()
        .iter()
        .all(|(program, _)| !program.contains("picotool")));
}

/// Parallel multi-device flashing produces one operation per device.
#[test]
fn flash_multiple_devices_in_parallel() {
    let first = ScriptedDevice::connected("DEV-A");
    let second = ScriptedDevice::connected("DEV-B");
    for device in [&first, &second] {
        device.schedule_after_bootloader_ack(&[
            (Duration::from_millis(30), MockMode::Gone),
            (Duration::from_millis(150), MockMode::Bootloader),
        ]);
    }

    let h = flash_harness(vec![first.clone(), second.clone()], Some("/usr/bin/picotool"));
    let dir = tempfile::tempdir().unwrap();
    let firmware_a = dir.path().join("fw-a.uf2");
    let firmware_b = dir.path().join("fw-b.uf2");
    std::fs::write(&firmware_a, [0xAAu8; 128]).unwrap();
    std::fs::write(&firmware_b, [0xBBu8; 128]).unwrap();

    // Each loader invocation reboots only the device it flashed.
    {
        let first = first.clone();
        let second = second.clone();
        h.executor.on_command("picotool", move |_, args| {
            let target = if args[1].contains("fw-a") {
                &first
            } else {
                &second
            };
            target.set_mode_after(Duration::from_millis(100), MockMode::Normal);
            Ok(ExecOutput {
                success: true,
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        });
    }

    let map: HashMap<String, PathBuf> = [
        ("DEV-A".to_string(), firmware_a),
        ("DEV-B".to_string(), firmware_b),
    ]
    .into();

    let results = h.supervisor.flash_multiple(&map, true, 2);
    assert_eq!(results.len(), 2);
    for (serial, operation) in &results {
        assert_eq!(
            operation.result,
            Some(FlashResult::Success),
            "device {serial} should flash successfully"
        );
    }
}

/// Cancellation fixes the operation's terminal state.
#[test]
fn flash_cancel_marks_operation() {
    let device = ScriptedDevice::connected("DEV001");
    // Never acknowledges: the entry phase would wait out its timeout.
    device.script(
        hidtest::frame::CommandKind::EnterBootloader,
        hidtest::test_helpers::mock_bus::Reply::Ignore,
    );

    let bus = Arc::new(MockBus::new());
    bus.add_device(device);
    let registry = Arc::new(DeviceRegistry::with_timing(
        bus,
        Duration::from_secs(1),
        Duration::from_millis(5),
    ));
    registry.discover();
    registry.connect("DEV001");
    let client = Arc::new(CommandClient::with_timeout(
        Arc::clone(&registry),
        None,
        Duration::from_millis(400),
    ));
    let supervisor = Arc::new(FlashSupervisor::with_options(
        registry,
        client,
        Arc::new(FakeExecutor::new()),
        Duration::from_secs(3),
        Duration::from_secs(3),
        Some(PathBuf::from("/usr/bin/picotool")),
    ));

    let canceller = {
        let supervisor = Arc::clone(&supervisor);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            supervisor.cancel("DEV001")
        })
    };

    let dir = tempfile::tempdir().unwrap();
    let firmware = firmware_file(&dir);
    let operation = supervisor.flash_firmware("DEV001", &firmware);
    canceller.join().unwrap();

    assert_eq!(operation.result, Some(FlashResult::Error));
    assert_eq!(operation.error_message.as_deref(), Some("Operation cancelled"));
    assert!(operation.end_time.is_some());
}
