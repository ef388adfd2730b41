use anyhow::{Context, Result};
use clap::Parser;
use kart_core::logging::{LogCategory, LogConfig, LogLevel};
use kart_core::System;
use kart_n64::cartridge::RomImage;
use kart_n64::host::{self, PiMaster, PiTiming, PifDriver};
use kart_n64::{CartConfig, CartSystem, CicVariant, VideoRegion, CARTRIDGE_MOUNT};
use std::fs;
use std::path::PathBuf;

/// Upper bound on ticks for any single driver run
const TICK_LIMIT: u64 = 50_000_000;

/// Size of the generated image used when no ROM is given
const TEST_PATTERN_SIZE: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "kart64", about = "N64 cartridge-bus bridge simulator")]
struct Args {
    /// ROM image (.z64, .n64, .v64). A test pattern is generated when omitted.
    rom: Option<PathBuf>,

    /// Cartridge configuration as JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// First header word written over the ROM (hex, default 80371240)
    #[arg(long, value_parser = parse_hex)]
    header: Option<u32>,

    /// Bus address of the first burst (hex)
    #[arg(long, value_parser = parse_hex, default_value = "10000000")]
    read: u32,

    /// Words per burst
    #[arg(long, default_value_t = 8)]
    words: usize,

    /// Number of consecutive bursts
    #[arg(long, default_value_t = 1)]
    bursts: usize,

    /// CIC variant: 6101, 6102, 6103, 6105, 6106, 7102
    #[arg(long)]
    cic: Option<String>,

    /// PAL console (NTSC otherwise)
    #[arg(long, default_value_t = false)]
    pal: bool,

    /// Run the CIC boot handshake from the PIF side and print it
    #[arg(long, default_value_t = false)]
    cic_handshake: bool,

    /// Write a diagnostics capture here (.csv for CSV, JSON otherwise)
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Dump save-state to this file as JSON
    #[arg(long)]
    save: Option<PathBuf>,

    /// Global simulator log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "off")]
    log_level: String,

    /// Log level for the bridge state machine
    #[arg(long)]
    log_bridge: Option<String>,

    /// Log level for bus sampling
    #[arg(long)]
    log_bus: Option<String>,

    /// Send simulator logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Maximum messages per second per log category
    #[arg(long)]
    log_rate: Option<usize>,

    /// Only print errors (still writes --capture and --save)
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .replace('_', "");
    u32::from_str_radix(&digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_level(s: &str) -> Result<LogLevel> {
    LogLevel::from_str(s).with_context(|| format!("unknown log level '{}'", s))
}

fn configure_logging(args: &Args) -> Result<()> {
    let config = LogConfig::global();
    config.set_global_level(parse_level(&args.log_level)?);
    if let Some(level) = &args.log_bridge {
        config.set_level(LogCategory::Bridge, parse_level(level)?);
    }
    if let Some(level) = &args.log_bus {
        config.set_level(LogCategory::Bus, parse_level(level)?);
    }
    if let Some(rate) = args.log_rate {
        config.set_rate_limit(rate);
    }
    if let Some(path) = &args.log_file {
        config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

fn cart_config(args: &Args) -> Result<CartConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            CartConfig::from_json(&text)?
        }
        None => CartConfig::default(),
    };
    if let Some(header) = args.header {
        config.header_override = Some(header);
    }
    if let Some(name) = &args.cic {
        config.cic.variant = match CicVariant::from_name(name) {
            Some(variant) => variant,
            None => anyhow::bail!("Unsupported CIC variant: {}", name),
        };
    }
    if args.pal {
        config.cic.region = VideoRegion::Pal;
    }
    if args.capture.is_some() && config.capture.is_none() {
        config.capture = Some(Default::default());
    }
    config.validate()?;
    Ok(config)
}

/// Hex dump rows of eight words; addresses wrap at the top of the bus
fn dump_rows(address: u32, words: &[u16]) -> Vec<String> {
    words
        .chunks(8)
        .enumerate()
        .map(|(row, chunk)| {
            let line: Vec<String> = chunk.iter().map(|w| format!("{:04X}", w)).collect();
            format!(
                "{:08X}: {}",
                address.wrapping_add((row * 16) as u32),
                line.join(" ")
            )
        })
        .collect()
}

fn print_words(address: u32, words: &[u16]) {
    for row in dump_rows(address, words) {
        println!("{}", row);
    }
}

fn run_handshake(sys: &mut CartSystem) -> Result<(u8, Vec<u8>, Vec<u8>)> {
    let mut pi = PiMaster::new(PiTiming::default());
    let mut pif = PifDriver::new(4);

    pif.queue_reset(16);
    pif.queue_read_nibbles(7);
    host::run(sys, &mut pi, Some(&mut pif), TICK_LIMIT)?;
    let mut head = pif.take_nibbles();
    let seed = head.split_off(1);

    pif.queue_read_bits(1);
    host::run(sys, &mut pi, Some(&mut pif), TICK_LIMIT)?;
    if pif.take_bits().first() != Some(&false) {
        log::warn!("CIC checksum marker bit was not zero");
    }

    pif.queue_read_nibbles(16);
    host::run(sys, &mut pi, Some(&mut pif), TICK_LIMIT)?;
    let checksum = pif.take_nibbles();

    Ok((head.first().copied().unwrap_or(0), seed, checksum))
}

fn nibbles(values: &[u8]) -> String {
    values.iter().map(|n| format!("{:X}", n)).collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    configure_logging(&args)?;

    let config = cart_config(&args)?;
    let mut sys = CartSystem::new(config)?;

    match &args.rom {
        Some(path) => {
            let data =
                fs::read(path).with_context(|| format!("reading ROM {}", path.display()))?;
            sys.mount(CARTRIDGE_MOUNT, &data)?;
        }
        None => {
            log::info!("no ROM given, using a generated test pattern");
            sys.load_rom(RomImage::test_pattern(TEST_PATTERN_SIZE));
        }
    }
    if let (false, Some(info)) = (args.quiet, sys.rom_info()) {
        println!(
            "ROM: \"{}\" {} bytes, {:?}, crc32 {:08X}, header {:08X}",
            info.title, info.size, info.byte_order, info.crc32, info.header
        );
    }

    let mut pi = PiMaster::new(PiTiming::default());
    let mut address = args.read;
    for _ in 0..args.bursts {
        pi.read_burst(address, args.words);
        let ticks = host::run(&mut sys, &mut pi, None, TICK_LIMIT)?;
        let words = pi.take_samples();
        log::debug!("burst at {:08X} took {} ticks", address, ticks);
        if !args.quiet {
            print_words(address, &words);
        }
        address = address.wrapping_add((args.words * 2) as u32);
    }
    if pi.conflicts() > 0 {
        log::warn!("{} ticks with AD driven by both sides", pi.conflicts());
    }

    if args.cic_handshake {
        let (hello, seed, checksum) = run_handshake(&mut sys)?;
        if !args.quiet {
            println!(
                "CIC: hello {:X}, seed {}, checksum {}",
                hello,
                nibbles(&seed),
                nibbles(&checksum)
            );
        }
    }

    if !args.quiet {
        println!(
            "Counters ({} ticks):\n{}",
            sys.tick_count(),
            serde_json::to_string_pretty(sys.counters())?
        );
    }

    if let (Some(path), Some(capture)) = (&args.capture, sys.capture()) {
        let is_csv = path.extension().is_some_and(|ext| ext == "csv");
        let text = if is_csv {
            capture.to_csv()
        } else {
            serde_json::to_string_pretty(&capture.to_json())?
        };
        fs::write(path, text).with_context(|| format!("writing capture {}", path.display()))?;
    }

    if let Some(path) = &args.save {
        let state = sys.save_state();
        fs::write(path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("writing save state {}", path.display()))?;
    }

    Ok(())
}
