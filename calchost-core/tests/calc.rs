//! Controller tests with on-disk ROM and state files.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use calchost_core::engine::HeadlessEngineFactory;
use calchost_core::{BreakpointSpec, Calc, CalcError, CalcEvent, Config, StepUnit, StopReason};
use tempfile::TempDir;

const KB: usize = 1024;

/// Wait for a link byte, echo it back, repeat.
const ECHO: [u8; 12] = [
    0xDB, 0x00, 0xE6, 0x01, 0x28, 0xFA, 0xDB, 0x08, 0xD3, 0x08, 0x18, 0xF4,
];

/// NOP; NOP; JR 0000h
const SPIN: [u8; 4] = [0x00, 0x00, 0x18, 0xFC];

fn manual() -> Config {
    Config {
        auto_start: false,
        ..Config::default()
    }
}

fn write_rom(dir: &TempDir, name: &str, program: &[u8], size: usize) -> PathBuf {
    let mut rom = vec![0xFF; size];
    rom[..program.len()].copy_from_slice(program);
    let path = dir.path().join(name);
    std::fs::write(&path, rom).unwrap();
    path
}

fn drain(events: &Receiver<CalcEvent>) -> Vec<CalcEvent> {
    events.try_iter().collect()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_load_announces_session() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    let events = calc.subscribe();

    calc.load(&rom, None, None).unwrap();

    assert_eq!(
        drain(&events),
        vec![
            CalcEvent::BeginLoad,
            CalcEvent::NameChanged("echo".to_string()),
            CalcEvent::FileChanged(rom.clone()),
            CalcEvent::Loaded,
            CalcEvent::ModelChanged {
                name: "ti83".to_string(),
                description: "TI-83 / TI-82 STATS".to_string(),
            },
        ]
    );
    assert_eq!(calc.model_description(), Some("TI-83 / TI-82 STATS"));
    assert_eq!((calc.lcd_width(), calc.lcd_height()), (96, 64));
    assert_eq!(calc.rom_file().as_deref(), Some(rom.as_path()));
    assert_eq!(calc.lcd_data().unwrap().len(), 96 * 64);
    assert!(!calc.is_running());
}

#[test]
fn test_echo_through_byte_api() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();

    calc.send_bytes(b"PING").unwrap();
    assert!(calc.is_sending());

    calc.run(20_000, StepUnit::Cycles).unwrap();

    assert!(!calc.is_sending());
    assert!(calc.is_receiving());
    assert_eq!(calc.byte_count().unwrap(), 4);
    assert_eq!(calc.top_byte().unwrap(), Some(b'P'));
    assert_eq!(calc.get_byte().unwrap(), Some(b'P'));
    assert_eq!(calc.get_bytes(10).unwrap(), b"ING".to_vec());
    assert_eq!(calc.get_byte().unwrap(), None);
}

#[test]
fn test_broadcast_toggle() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();
    let events = calc.subscribe();

    calc.set_broadcasting(false);
    calc.send_byte(1).unwrap();
    calc.run(5_000, StepUnit::Cycles).unwrap();
    assert!(!drain(&events).contains(&CalcEvent::BytesAvailable));

    calc.set_broadcasting(true);
    calc.send_byte(2).unwrap();
    calc.run(5_000, StepUnit::Cycles).unwrap();
    assert!(drain(&events).contains(&CalcEvent::BytesAvailable));
}

#[test]
fn test_failed_load_keeps_current_session() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();
    calc.send_byte(0x55).unwrap();
    let events = calc.subscribe();

    let missing = dir.path().join("missing.rom");
    let err = calc.load(&missing, None, None).unwrap_err();
    assert!(matches!(err, CalcError::Open { ref path, .. } if path == &missing));

    let garbage = dir.path().join("garbage.sav");
    std::fs::write(&garbage, b"not a save state").unwrap();
    let other = write_rom(&dir, "other.rom", &SPIN, 256 * KB);
    assert!(matches!(
        calc.load(&other, Some(&garbage), None),
        Err(CalcError::Json(_))
    ));

    assert!(drain(&events).is_empty());
    assert_eq!(calc.rom_file().as_deref(), Some(rom.as_path()));
    assert_eq!(calc.name(), "echo");

    // Queued input survived along with the session.
    calc.run(5_000, StepUnit::Cycles).unwrap();
    assert_eq!(calc.get_byte().unwrap(), Some(0x55));
}

#[test]
fn test_undetected_rom_uses_default_model() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "odd.rom", &SPIN, 48 * KB);

    let calc = Calc::new(Config {
        default_model: Some("86".to_string()),
        ..manual()
    });
    calc.load(&rom, None, None).unwrap();
    assert_eq!(calc.model_name(), Some("ti86"));
    assert_eq!(calc.lcd_width(), 128);

    let strict = Calc::new(Config {
        default_model: None,
        ..manual()
    });
    assert!(matches!(
        strict.load(&rom, None, None),
        Err(CalcError::UnsupportedModel(_))
    ));
    assert!(strict.model().is_none());
}

#[test]
fn test_explicit_model_must_exist() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "spin.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());

    assert!(matches!(
        calc.load(&rom, None, Some("89")),
        Err(CalcError::UnsupportedModel(m)) if m == "89"
    ));
    calc.load(&rom, None, Some("83P")).unwrap();
    assert_eq!(calc.model_description(), Some("TI-83 Plus"));
}

#[test]
fn test_guess_rom_type() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "plus.rom", &SPIN, 512 * KB);
    let calc = Calc::new(manual());

    let guess = calc.guess_rom_type(&rom).unwrap();
    assert_eq!(guess.descriptions.len(), 6);
    assert_eq!(guess.guessed.map(|i| guess.descriptions[i]), Some("TI-83 Plus"));
}

fn saved_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("saved"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_save_writes_rom_only_for_flash_models() {
    let dir = TempDir::new().unwrap();

    let rom = write_rom(&dir, "ti83.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();
    calc.save(&dir.path().join("saved83.rom")).unwrap();

    let flash_rom = write_rom(&dir, "ti83p.rom", &SPIN, 512 * KB);
    let flash = Calc::new(manual());
    flash.load(&flash_rom, None, None).unwrap();
    flash.save(&dir.path().join("saved83p.rom")).unwrap();

    assert_eq!(
        saved_files(dir.path()),
        vec!["saved83.sav", "saved83p.rom", "saved83p.sav"]
    );
}

#[test]
fn test_state_round_trip_through_files() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();
    calc.run(1_000, StepUnit::Cycles).unwrap();

    let target = dir.path().join("snap.rom");
    calc.save(&target).unwrap();

    let restored = Calc::new(manual());
    restored
        .load(&rom, Some(&target.with_extension("sav")), None)
        .unwrap();
    restored.send_byte(b'!').unwrap();
    restored.run(5_000, StepUnit::Cycles).unwrap();
    assert_eq!(restored.get_byte().unwrap(), Some(b'!'));
}

#[test]
fn test_reset_keeps_queues() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();

    calc.send_byte(7).unwrap();
    calc.reset().unwrap();
    calc.run(5_000, StepUnit::Cycles).unwrap();
    assert_eq!(calc.get_byte().unwrap(), Some(7));
}

#[test]
fn test_worker_echoes_and_pauses() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "echo.rom", &ECHO, 256 * KB);
    let calc = Calc::new(Config::default());
    let events = calc.subscribe();

    calc.load(&rom, None, None).unwrap();
    assert!(calc.is_running());

    calc.send_bytes(b"OK").unwrap();
    wait_for("echo", || calc.byte_count().unwrap_or(0) >= 2);
    assert_eq!(calc.get_bytes(2).unwrap(), b"OK".to_vec());

    calc.pause().unwrap();
    assert!(!calc.is_running());

    let seen = drain(&events);
    assert!(seen.contains(&CalcEvent::RunningChanged(true)));
    assert_eq!(seen.last(), Some(&CalcEvent::RunningChanged(false)));
}

#[test]
fn test_worker_pauses_on_breakpoint() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "spin.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();
    let handle = calc
        .add_breakpoint_with(BreakpointSpec::exec(0x0002, 0x0003), None)
        .unwrap();
    let events = calc.subscribe();

    calc.resume().unwrap();
    calc.wait().unwrap();

    assert!(!calc.is_running());
    assert!(drain(&events).iter().any(|e| matches!(
        e,
        CalcEvent::Breakpoint { handle: Some(h), .. } if *h == handle
    )));
}

#[test]
fn test_stop_interrupts_run_in_progress() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "spin.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();

    let reason = std::thread::scope(|scope| {
        let running = scope.spawn(|| calc.run(u32::MAX, StepUnit::Cycles));
        // Requests before the run is under way are dropped, so keep asking.
        wait_for("run to stop", || {
            calc.stop(StopReason::empty());
            running.is_finished()
        });
        running.join().unwrap()
    })
    .unwrap();

    assert!(reason.contains(StopReason::REQUESTED));
}

#[test]
fn test_stop_between_runs_does_not_carry_over() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "spin.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();

    calc.stop(StopReason::empty());
    let reason = calc.run(1_000, StepUnit::Cycles).unwrap();
    assert!(reason.is_empty());

    calc.stop(StopReason::empty());
    calc.resume().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(calc.is_running());
    calc.pause().unwrap();
    assert!(!calc.is_running());
}

#[test]
fn test_breakpoint_api_round_trip() {
    let dir = TempDir::new().unwrap();
    let rom = write_rom(&dir, "spin.rom", &SPIN, 256 * KB);
    let calc = Calc::new(manual());
    calc.load(&rom, None, None).unwrap();

    let first = calc.add_breakpoint(None).unwrap();
    let second = calc.add_breakpoint(None).unwrap();
    calc.set_breakpoint_start(second, 0x1234).unwrap();
    calc.set_breakpoint_mask(second, 0xFFFF).unwrap();
    calc.set_breakpoint_physical(second, true).unwrap();

    calc.remove_breakpoint(first).unwrap();
    assert_eq!(calc.breakpoint_handles().unwrap(), vec![second]);
    assert_eq!(calc.breakpoint_start(second).unwrap(), 0x1234);
    assert_eq!(calc.breakpoint_mask(second).unwrap(), 0xFFFF);
    assert!(calc.breakpoint_physical(second).unwrap());
    assert!(matches!(
        calc.breakpoint_end(first),
        Err(CalcError::UnknownBreakpoint(h)) if h == first
    ));
}

#[test]
fn test_headless_factory_detects_tagged_rom() {
    let dir = TempDir::new().unwrap();
    let rom = dir.path().join("tagged.rom");
    std::fs::write(&rom, b"MODEL=85;payload").unwrap();

    let calc = Calc::with_factory(manual(), HeadlessEngineFactory::default());
    calc.load(&rom, None, None).unwrap();
    assert_eq!(calc.model_description(), Some("TI-85"));
}
