//! SDRAM backing-store model.
//!
//! A 16-bit wide word store with a fixed access latency and periodic
//! refresh. Refresh is postponed while an access is in flight and blocks
//! new accesses while it runs.

use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::port::{MemoryOp, MemoryPort, MemoryRequest, PortOutcome};
use kart_core::Clocked;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdramConfig {
    pub size_bytes: usize,
    /// Ticks from submit to completion
    pub latency: u32,
    /// Ticks between refresh starts; 0 disables refresh
    pub refresh_interval: u32,
    pub refresh_ticks: u32,
}

impl Default for SdramConfig {
    fn default() -> Self {
        Self {
            size_bytes: 8 * 1024 * 1024,
            latency: 4,
            refresh_interval: 468,
            refresh_ticks: 8,
        }
    }
}

impl SdramConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.size_bytes < 2 || !self.size_bytes.is_power_of_two() {
            return Err(format!(
                "SDRAM size must be a power of two, got {} bytes",
                self.size_bytes
            ));
        }
        if self.refresh_interval != 0 && self.refresh_ticks >= self.refresh_interval {
            return Err("SDRAM refresh would never finish".to_string());
        }
        Ok(())
    }

    pub fn size_words(&self) -> usize {
        self.size_bytes / 2
    }
}

#[derive(Debug, Clone, Copy)]
struct Access {
    request: MemoryRequest,
    remaining: u32,
}

pub struct Sdram {
    config: SdramConfig,
    words: Vec<u16>,
    mask: u32,
    active: Option<Access>,
    refresh_timer: u32,
    refresh_remaining: u32,
    refreshes: u64,
}

impl Sdram {
    pub fn new(config: SdramConfig) -> Self {
        let words = config.size_words().max(1);
        Self {
            words: vec![0; words],
            mask: (words - 1) as u32,
            active: None,
            refresh_timer: config.refresh_interval,
            refresh_remaining: 0,
            refreshes: 0,
            config,
        }
    }

    pub fn config(&self) -> &SdramConfig {
        &self.config
    }

    pub fn size_words(&self) -> usize {
        self.words.len()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Copy words in starting at `offset`, as an uploader would before boot.
    pub fn load_words(&mut self, offset: u32, data: &[u16]) {
        for (i, &word) in data.iter().enumerate() {
            let address = (offset as usize + i) as u32 & self.mask;
            self.words[address as usize] = word;
        }
        log(LogCategory::Memory, LogLevel::Info, || {
            format!("sdram: loaded {} words at {:#x}", data.len(), offset)
        });
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn read_word(&self, address: u32) -> u16 {
        self.words[(address & self.mask) as usize]
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        self.words[(address & self.mask) as usize] = value;
    }

    fn perform(&mut self, request: MemoryRequest) -> PortOutcome {
        match request.op {
            MemoryOp::Read => PortOutcome::Completed(Some(self.read_word(request.address))),
            MemoryOp::Write => {
                self.write_word(request.address, request.data.unwrap_or(0));
                PortOutcome::Completed(None)
            }
        }
    }
}

impl Clocked for Sdram {
    /// Drop any in-flight access and restart the refresh timer. Contents
    /// survive, as they would across a console reset.
    fn reset(&mut self) {
        self.active = None;
        self.refresh_timer = self.config.refresh_interval;
        self.refresh_remaining = 0;
    }

    fn tick(&mut self) {
        if self.refresh_remaining > 0 {
            self.refresh_remaining -= 1;
        } else if let Some(access) = self.active.as_mut() {
            access.remaining = access.remaining.saturating_sub(1);
        }

        if self.config.refresh_interval == 0 {
            return;
        }
        if self.refresh_timer > 0 {
            self.refresh_timer -= 1;
        }
        if self.refresh_timer == 0 && self.active.is_none() && self.refresh_remaining == 0 {
            self.refresh_remaining = self.config.refresh_ticks;
            self.refresh_timer = self.config.refresh_interval;
            self.refreshes += 1;
            log(LogCategory::Memory, LogLevel::Trace, || {
                "sdram: refresh".to_string()
            });
        }
    }
}

impl MemoryPort for Sdram {
    fn submit(&mut self, request: MemoryRequest) -> PortOutcome {
        if self.active.is_some() {
            log(LogCategory::Memory, LogLevel::Error, || {
                "sdram: submit while an access is in flight, earlier access dropped".to_string()
            });
        }
        if self.config.latency == 0 && self.refresh_remaining == 0 {
            self.active = None;
            return self.perform(request);
        }
        self.active = Some(Access {
            request,
            remaining: self.config.latency,
        });
        PortOutcome::Busy
    }

    fn poll(&mut self) -> PortOutcome {
        match self.active {
            Some(access) if access.remaining == 0 && self.refresh_remaining == 0 => {
                self.active = None;
                self.perform(access.request)
            }
            Some(_) => PortOutcome::Busy,
            None => PortOutcome::Completed(None),
        }
    }

    fn refresh_in_progress(&self) -> bool {
        self.refresh_remaining > 0
    }
}
