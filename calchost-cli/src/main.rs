//! calchost - drive an emulated calculator from the terminal.
//!
//! Usage:
//!   calchost <rom> [options]
//!
//! Examples:
//!   calchost ti83.rom                          # Interactive: keys go out on the link
//!   calchost ti83.rom --state ti83.sav         # Resume a saved session
//!   calchost ti83.rom --run-ms 500 --screen    # Run headless, print the LCD
//!   calchost ti83.rom --send 48454c4c4f --run-ms 100
//!   calchost ti83.rom --break 0x4000 --physical --run-ms 1000

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc as tokio_mpsc;

use calchost_core::{BreakpointSpec, Calc, CalcEvent, CalcResult, Config};

/// Calculator emulator host
#[derive(Parser, Debug)]
#[command(name = "calchost")]
#[command(about = "Run a calculator ROM and talk to it over the link port")]
struct Args {
    /// ROM image to load
    rom: PathBuf,

    /// Save state to restore
    #[arg(long)]
    state: Option<PathBuf>,

    /// Model id (82, 83, 83p, 83pse, 85, 86); detected from the ROM if omitted
    #[arg(long)]
    model: Option<String>,

    /// Config file (defaults to ./calchost.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace every link byte
    #[arg(short, long)]
    trace: bool,

    /// Hex bytes to send over the link at startup
    #[arg(long, value_name = "HEX")]
    send: Option<String>,

    /// File whose contents are sent over the link at startup
    #[arg(long, value_name = "PATH")]
    send_file: Option<PathBuf>,

    /// Execution breakpoint address (hex, repeatable)
    #[arg(long = "break", value_name = "ADDR", value_parser = parse_addr)]
    breaks: Vec<u32>,

    /// Treat breakpoint addresses as physical
    #[arg(long)]
    physical: bool,

    /// Run without a terminal for this many milliseconds, then exit
    #[arg(long, value_name = "MS")]
    run_ms: Option<u64>,

    /// Print the LCD before exiting
    #[arg(long)]
    screen: bool,

    /// Save the session before exiting (ROM for flash models, plus .sav)
    #[arg(long, value_name = "PATH")]
    save_to: Option<PathBuf>,
}

/// Parse an address like `4000`, `0x4000` or `$4000`.
fn parse_addr(s: &str) -> Result<u32, String> {
    let digits = s
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_start_matches('$');
    u32::from_str_radix(digits, 16).map_err(|e| format!("bad address {:?}: {}", s, e))
}

/// Parse a hex byte string, ignoring whitespace.
fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", s));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(text, 16).map_err(|e| format!("bad hex {:?}: {}", text, e))
        })
        .collect()
}

/// Terminal input.
enum Input {
    Byte(u8),
    Quit,
}

/// Translate crossterm key events to link bytes.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<Input> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            if c == ']' {
                return Some(Input::Quit);
            }
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(Input::Byte(upper as u8 - 64)); // Ctrl+A=1, Ctrl+C=3, etc.
            }
        }
    }

    match code {
        KeyCode::Esc => Some(Input::Quit),
        KeyCode::Char(c) if c.is_ascii() => Some(Input::Byte(c as u8)),
        KeyCode::Enter => Some(Input::Byte(13)),
        KeyCode::Backspace => Some(Input::Byte(8)),
        KeyCode::Tab => Some(Input::Byte(9)),
        _ => None,
    }
}

/// Write device output to the terminal.
fn write_output(bytes: &[u8]) {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    for &b in bytes {
        let _ = match b {
            // Raw mode needs an explicit carriage return
            0x0A => handle.write_all(b"\r\n"),
            0x08 => handle.write_all(b"\x08 \x08"),
            0x20..=0x7E | 0x0D | 0x07 => handle.write_all(&[b]),
            _ => write!(handle, "<{:02x}>", b),
        };
    }
    let _ = handle.flush();
}

/// Move device output to stdout and report events. Returns false once the
/// worker has stopped by itself.
fn pump(calc: &Calc, events: &Receiver<CalcEvent>) -> CalcResult<bool> {
    let bytes = calc.get_bytes(usize::MAX)?;
    if !bytes.is_empty() {
        write_output(&bytes);
    }

    let mut running = true;
    for event in events.try_iter() {
        match event {
            CalcEvent::Breakpoint { engine_id, handle } => match handle {
                Some(handle) => eprint!("\r\nBreakpoint {} hit\r\n", handle),
                None => eprint!("\r\nEngine breakpoint {} hit\r\n", engine_id),
            },
            CalcEvent::RunningChanged(false) => running = false,
            _ => {}
        }
    }
    Ok(running)
}

/// Render the composite LCD with ASCII shades, two pixel rows per line.
fn print_screen(calc: &Calc) -> CalcResult<()> {
    const SHADES: &[u8] = b"@%#*+=-:. ";

    // Let the grayscale filter settle on the final frame.
    for _ in 0..48 {
        calc.lcd_update()?;
    }

    let width = calc.lcd_width();
    let height = calc.lcd_height() / 2;
    let pixels = calc.lcd_scaled(width, height)?;

    let mut out = String::with_capacity((width + 3) * (height + 2));
    out.push('+');
    out.push_str(&"-".repeat(width));
    out.push_str("+\n");
    for row in pixels.chunks(width.max(1)) {
        out.push('|');
        for &pixel in row {
            let level = (pixel & 0xFF) as usize;
            out.push(SHADES[level * (SHADES.len() - 1) / 255] as char);
        }
        out.push_str("|\n");
    }
    out.push('+');
    out.push_str(&"-".repeat(width));
    out.push_str("+\n");
    print!("{}", out);
    Ok(())
}

/// Run for a fixed wall-clock time without touching the terminal.
async fn run_headless(calc: &Calc, events: &Receiver<CalcEvent>, ms: u64) -> CalcResult<()> {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !pump(calc, events)? {
            break;
        }
    }
    Ok(())
}

/// Forward key presses to the link until the user quits.
async fn run_interactive(calc: &Calc, events: &Receiver<CalcEvent>) -> CalcResult<()> {
    let (key_tx, mut key_rx) = tokio_mpsc::unbounded_channel::<Input>();
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    // Enable raw mode (gracefully handle non-TTY)
    let raw_mode_enabled = enable_raw_mode().is_ok();
    eprint!("Connected to link port. Esc or Ctrl-] quits.\r\n");

    // Spawn terminal input reader
    let input_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    // Poll for terminal events
                    if event::poll(Duration::from_millis(0)).unwrap_or(false) {
                        if let Ok(Event::Key(key_event)) = event::read() {
                            if let Some(input) = translate_key(key_event.code, key_event.modifiers) {
                                if key_tx.send(input).is_err() {
                                    break; // Channel closed
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    let result = async {
        loop {
            tokio::select! {
                input = key_rx.recv() => match input {
                    Some(Input::Byte(b)) => calc.send_byte(b)?,
                    Some(Input::Quit) | None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    pump(calc, events)?;
                }
            }
        }
        Ok::<(), calchost_core::CalcError>(())
    }
    .await;

    // Signal input handler to stop
    let _ = shutdown_tx.send(()).await;
    let _ = input_handle.await;

    // Disable raw mode if we enabled it
    if raw_mode_enabled {
        let _ = disable_raw_mode();
    }
    eprintln!();
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.trace { "trace" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    // Breakpoints and startup bytes must be in place before the first slice.
    config.auto_start = false;

    log::debug!("Using config {:?}", config);

    let calc = Calc::new(config);
    let events = calc.subscribe();

    calc.load(&args.rom, args.state.as_deref(), args.model.as_deref())?;
    eprintln!(
        "Loaded {} ({})",
        args.rom.display(),
        calc.model_description().unwrap_or("unknown model")
    );

    for &addr in &args.breaks {
        let spec = BreakpointSpec::exec(addr, addr.saturating_add(1)).physical(args.physical);
        let handle = calc.add_breakpoint_with(spec, None)?;
        eprintln!("Breakpoint {} at {:#06x}", handle, addr);
    }

    if let Some(hex) = &args.send {
        calc.send_bytes(&parse_hex(hex)?)?;
    }
    if let Some(path) = &args.send_file {
        calc.send_bytes(&std::fs::read(path)?)?;
    }

    calc.start()?;

    let result = match args.run_ms {
        Some(ms) => run_headless(&calc, &events, ms).await,
        None => run_interactive(&calc, &events).await,
    };

    calc.pause()?;
    // Output produced by the last slices
    pump(&calc, &events)?;
    result?;

    if args.screen {
        print_screen(&calc)?;
    }
    if let Some(path) = &args.save_to {
        calc.save(path)?;
        eprintln!("Saved to {}", path.display());
    }

    Ok(())
}
