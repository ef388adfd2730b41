//! N64 cartridge-bus bridge.
//!
//! Simulates the cartridge side of the N64 parallel bus, one clock tick at
//! a time:
//!
//! - **Sampler**: synchronizes ALE_H/ALE_L, /READ, /WRITE and AD and decodes
//!   them into bus events
//! - **Bridge**: the transaction state machine; latches addresses, issues
//!   memory requests and drives read data back onto AD
//! - **SDRAM**: backing store holding the ROM image, with latency and refresh
//! - **Control block**: small register file at the top of the ROM window
//! - **CIC**: lockout chip handshake on the sideband lines
//! - **Tap**: read-only per-tick diagnostics capture

pub mod bridge;
pub mod cartridge;
pub mod cic;
pub mod config;
pub mod control;
pub mod host;
pub mod latch;
pub mod sampler;
pub mod sdram;
pub mod tap;

pub use bridge::{Bridge, BridgeConfig, BridgeCounters, BridgeState, OverrunPolicy};
pub use cic::{CicConfig, CicPins, CicVariant, VideoRegion};
pub use config::CartConfig;
pub use host::{PiMaster, PiTiming, PifDriver};
pub use sampler::BusPins;

use bridge::BridgePorts;
use cartridge::{ByteOrder, RomImage};
use cic::Cic;
use control::ControlBlock;
use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::signal::{SyncError, Tristate};
use kart_core::{Clocked, MountPointInfo, System};
use sampler::BusSampler;
use sdram::Sdram;
use serde::de::Error as _;
use tap::{Capture, TapSample};
use thiserror::Error;

pub const CARTRIDGE_MOUNT: &str = "Cartridge";

const STATE_VERSION: u64 = 1;

#[derive(Error, Debug)]
pub enum CartError {
    #[error("Invalid ROM format: {0}")]
    InvalidRom(String),
    #[error("ROM too large: {size} bytes, at most {max} fit")]
    RomTooLarge { size: usize, max: usize },
    #[error("No cartridge mounted")]
    NoCartridge,
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Bus drivers still busy after {0} ticks")]
    Timeout(u64),
}

/// Everything the console drives into the cartridge in one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CartInputs {
    pub bus: BusPins,
    pub cic: CicPins,
}

/// Everything the cartridge drives back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartOutputs {
    pub ad: Tristate<u16>,
    pub cic_dio: Tristate<bool>,
}

/// What was loaded into the cartridge slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInfo {
    pub title: String,
    pub size: usize,
    pub crc32: u32,
    pub header: u32,
    pub byte_order: ByteOrder,
}

pub struct CartSystem {
    config: CartConfig,
    sampler: BusSampler,
    bridge: Bridge,
    sdram: Sdram,
    control: ControlBlock,
    cic: Cic,
    capture: Option<Capture>,
    rom: Option<RomInfo>,
    tick: u64,
}

impl CartSystem {
    pub fn new(config: CartConfig) -> Result<Self, CartError> {
        config.validate()?;
        Ok(Self {
            sampler: BusSampler::new(config.bridge.sync_stages)?,
            bridge: Bridge::new(config.bridge.clone()),
            sdram: Sdram::new(config.sdram.clone()),
            control: ControlBlock::new(),
            cic: Cic::new(config.cic.clone())?,
            capture: config.capture.clone().map(Capture::new),
            rom: None,
            tick: 0,
            config,
        })
    }

    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn counters(&self) -> &BridgeCounters {
        self.bridge.counters()
    }

    pub fn sdram(&self) -> &Sdram {
        &self.sdram
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    pub fn cic(&self) -> &Cic {
        &self.cic
    }

    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    pub fn rom_info(&self) -> Option<&RomInfo> {
        self.rom.as_ref()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Load an image into the slot. Also used by `mount`.
    pub fn load_rom(&mut self, rom: RomImage) {
        let rom = match self.config.header_override {
            Some(header) => rom.with_header(header),
            None => rom,
        };
        self.sdram.clear();
        self.sdram.load_words(0, &rom.words());
        let info = RomInfo {
            title: rom.title(),
            size: rom.size(),
            crc32: rom.crc32(),
            header: rom.header(),
            byte_order: rom.byte_order(),
        };
        log(LogCategory::Memory, LogLevel::Info, || {
            format!(
                "cart: loaded \"{}\" ({} bytes, crc32 {:08x}, header {:08x})",
                info.title, info.size, info.crc32, info.header
            )
        });
        self.rom = Some(info);
        self.reset();
    }
}

impl System for CartSystem {
    type Error = CartError;
    type Input = CartInputs;
    type Output = CartOutputs;

    fn reset(&mut self) {
        self.sampler.reset();
        self.bridge.reset();
        self.sdram.reset();
        self.control.reset();
        self.cic.reset();
        if let Some(capture) = self.capture.as_mut() {
            capture.clear();
        }
        self.tick = 0;
    }

    fn step(&mut self, input: &CartInputs) -> Result<CartOutputs, CartError> {
        if self.rom.is_none() {
            return Err(CartError::NoCartridge);
        }

        let sampled = self.sampler.sample(&input.bus);
        let ad = {
            let mut ports = BridgePorts {
                backing: &mut self.sdram,
                control: &mut self.control,
            };
            self.bridge.tick(&sampled, &mut ports)
        };
        self.sdram.tick();

        let cic_dio = self.cic.tick(&input.cic, self.control.cic_hold());
        self.control.set_cic_status(self.cic.status_word());

        if let Some(capture) = self.capture.as_mut() {
            capture.record(TapSample::capture(
                self.tick,
                &self.sampler,
                &self.bridge,
                &self.cic,
            ));
        }
        self.tick += 1;

        Ok(CartOutputs { ad, cic_dio })
    }

    fn save_state(&self) -> serde_json::Value {
        serde_json::json!({
            "version": STATE_VERSION,
            "tick": self.tick,
            "bridge": serde_json::to_value(self.bridge.regs()).unwrap_or_default(),
        })
    }

    fn load_state(&mut self, v: &serde_json::Value) -> Result<(), serde_json::Error> {
        let version = v["version"].as_u64().unwrap_or(0);
        if version != STATE_VERSION {
            return Err(serde_json::Error::custom(format!(
                "unsupported save state version {}",
                version
            )));
        }
        let regs = serde_json::from_value(v["bridge"].clone())?;
        // Pin history and the port's in-flight access start over
        self.sampler.reset();
        self.sdram.reset();
        self.bridge.restore(regs);
        self.tick = v["tick"].as_u64().unwrap_or(0);
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: CARTRIDGE_MOUNT.to_string(),
            name: "Cartridge Slot".to_string(),
            extensions: vec!["z64".to_string(), "n64".to_string(), "v64".to_string()],
            required: true,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        if mount_point_id != CARTRIDGE_MOUNT {
            return Err(CartError::InvalidMountPoint(mount_point_id.to_string()));
        }
        let rom = RomImage::load(data, self.config.sdram.size_bytes)?;
        self.load_rom(rom);
        Ok(())
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        if mount_point_id != CARTRIDGE_MOUNT {
            return Err(CartError::InvalidMountPoint(mount_point_id.to_string()));
        }
        self.rom = None;
        self.sdram.clear();
        Ok(())
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        mount_point_id == CARTRIDGE_MOUNT && self.rom.is_some()
    }
}
