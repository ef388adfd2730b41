//! Console-side drivers: what the N64's peripheral interface and PIF do to
//! the cartridge edge, tick by tick.
//!
//! Both drivers are planned as a queue of segments. Each tick the caller
//! asks for the pins to present, steps the cartridge, then hands the
//! cartridge's outputs back so shared lines can be resolved and sampled.

use crate::cic::CicPins;
use crate::sampler::{BusPins, AD_IDLE};
use crate::{CartError, CartInputs, CartOutputs, CartSystem};
use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::signal::Tristate;
use kart_core::System;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// PI cycle timing in cartridge clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiTiming {
    /// Each latch strobe's high time
    pub ale_ticks: u32,
    /// Gap between address phase and the first strobe
    pub latency_ticks: u32,
    /// Strobe low time
    pub pulse_ticks: u32,
    /// Strobe high time between words
    pub release_ticks: u32,
}

impl Default for PiTiming {
    fn default() -> Self {
        Self {
            ale_ticks: 4,
            latency_ticks: 8,
            pulse_ticks: 32,
            release_ticks: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BusSegment {
    ale_h: bool,
    ale_l: bool,
    read: bool,
    write: bool,
    ad: Tristate<u16>,
    ticks: u32,
    /// Sample AD on the last tick
    sample: bool,
}

impl BusSegment {
    fn idle(ticks: u32) -> Self {
        Self {
            ale_h: false,
            ale_l: false,
            read: false,
            write: false,
            ad: Tristate::released(AD_IDLE),
            ticks,
            sample: false,
        }
    }
}

/// The console's peripheral interface
pub struct PiMaster {
    timing: PiTiming,
    queue: VecDeque<BusSegment>,
    current: Option<(BusSegment, u32)>,
    cart_ad: Tristate<u16>,
    samples: Vec<u16>,
    conflicts: u64,
}

impl PiMaster {
    pub fn new(timing: PiTiming) -> Self {
        Self {
            timing,
            queue: VecDeque::new(),
            current: None,
            cart_ad: Tristate::released(AD_IDLE),
            samples: Vec::new(),
            conflicts: 0,
        }
    }

    pub fn timing(&self) -> &PiTiming {
        &self.timing
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts
    }

    /// Words sampled during read pulses so far
    pub fn take_samples(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.samples)
    }

    /// Plan an address phase: high half under ALE_H, low half under ALE_L.
    pub fn queue_address(&mut self, address: u32) {
        let ale = self.timing.ale_ticks.max(1);
        let high = Tristate::driven((address >> 16) as u16);
        let low = Tristate::driven(address as u16);
        let phase = [
            (true, true, high, ale),
            // ALE_H falls while the high half is still on AD
            (false, true, high, 1),
            (false, true, low, ale),
            (false, false, low, 1),
        ];
        for (ale_h, ale_l, ad, ticks) in phase {
            self.queue.push_back(BusSegment {
                ale_h,
                ale_l,
                ad,
                ticks,
                ..BusSegment::idle(0)
            });
        }
        self.queue
            .push_back(BusSegment::idle(self.timing.latency_ticks.max(1)));
    }

    pub fn queue_reads(&mut self, words: usize) {
        for _ in 0..words {
            self.queue.push_back(BusSegment {
                read: true,
                ticks: self.timing.pulse_ticks.max(1),
                sample: true,
                ..BusSegment::idle(0)
            });
            self.queue
                .push_back(BusSegment::idle(self.timing.release_ticks.max(1)));
        }
    }

    pub fn queue_writes(&mut self, data: &[u16]) {
        for &word in data {
            let ad = Tristate::driven(word);
            self.queue.push_back(BusSegment {
                ad,
                ..BusSegment::idle(1)
            });
            self.queue.push_back(BusSegment {
                write: true,
                ad,
                ticks: self.timing.pulse_ticks.max(1),
                ..BusSegment::idle(0)
            });
            self.queue.push_back(BusSegment {
                ad,
                ..BusSegment::idle(1)
            });
            self.queue
                .push_back(BusSegment::idle(self.timing.release_ticks.max(1)));
        }
    }

    pub fn read_burst(&mut self, address: u32, words: usize) {
        self.queue_address(address);
        self.queue_reads(words);
    }

    pub fn write_burst(&mut self, address: u32, data: &[u16]) {
        self.queue_address(address);
        self.queue_writes(data);
    }

    /// Drive both strobes at once for `ticks`. Only useful for testing the
    /// cartridge's protocol checks.
    pub fn queue_strobe_clash(&mut self, ticks: u32) {
        self.queue.push_back(BusSegment {
            read: true,
            write: true,
            ticks: ticks.max(1),
            ..BusSegment::idle(0)
        });
        self.queue
            .push_back(BusSegment::idle(self.timing.release_ticks.max(1)));
    }

    fn segment(&mut self) -> BusSegment {
        if self.current.is_none() {
            self.current = self.queue.pop_front().map(|seg| (seg, 0));
        }
        self.current
            .map(|(seg, _)| seg)
            .unwrap_or(BusSegment::idle(1))
    }

    /// Pins for this tick, AD resolved against the cartridge's last output
    pub fn next_pins(&mut self) -> BusPins {
        let seg = self.segment();
        BusPins {
            ale_h: seg.ale_h,
            ale_l: seg.ale_l,
            read_n: !seg.read,
            write_n: !seg.write,
            ad: seg.ad.resolve_with(&self.cart_ad, AD_IDLE).value,
        }
    }

    /// Record the cartridge's AD output for this tick and move on.
    pub fn observe(&mut self, cart_ad: Tristate<u16>) {
        self.cart_ad = cart_ad;
        let Some((seg, elapsed)) = self.current.as_mut() else {
            return;
        };
        *elapsed += 1;
        let resolved = seg.ad.resolve_with(&cart_ad, AD_IDLE);
        if resolved.conflict {
            self.conflicts += 1;
            log(LogCategory::Bus, LogLevel::Warn, || {
                "pi: AD driven by both sides".to_string()
            });
        }
        if *elapsed >= seg.ticks {
            if seg.sample {
                self.samples.push(resolved.value);
            }
            self.current = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PifStep {
    /// Hold cold reset low, then release it
    Reset(u32),
    Bit(Option<bool>),
}

/// The PIF side of the CIC exchange
pub struct PifDriver {
    half_period: u32,
    queue: VecDeque<PifStep>,
    current: Option<(PifStep, u32)>,
    cold_reset: bool,
    cart_dio: Tristate<bool>,
    bits: Vec<bool>,
}

impl PifDriver {
    pub fn new(half_period: u32) -> Self {
        Self {
            half_period: half_period.max(1),
            queue: VecDeque::new(),
            current: None,
            cold_reset: false,
            cart_dio: Tristate::released(true),
            bits: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn queue_reset(&mut self, ticks: u32) {
        self.queue.push_back(PifStep::Reset(ticks.max(1)));
    }

    pub fn queue_read_bits(&mut self, count: usize) {
        self.queue
            .extend(std::iter::repeat(PifStep::Bit(None)).take(count));
    }

    pub fn queue_read_nibbles(&mut self, count: usize) {
        self.queue_read_bits(count * 4);
    }

    pub fn queue_write_bits(&mut self, bits: &[bool]) {
        self.queue
            .extend(bits.iter().map(|&bit| PifStep::Bit(Some(bit))));
    }

    pub fn queue_write_nibble(&mut self, value: u8) {
        let bits: Vec<bool> = (0..4).rev().map(|s| (value >> s) & 1 != 0).collect();
        self.queue_write_bits(&bits);
    }

    /// Bits seen on DIO at the end of each low half period, reads and
    /// writes alike
    pub fn take_bits(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.bits)
    }

    pub fn take_nibbles(&mut self) -> Vec<u8> {
        let bits = self.take_bits();
        bits.chunks_exact(4)
            .map(|c| c.iter().fold(0u8, |acc, &b| acc << 1 | b as u8))
            .collect()
    }

    fn step(&mut self) -> Option<(PifStep, u32)> {
        if self.current.is_none() {
            self.current = self.queue.pop_front().map(|s| (s, 0));
        }
        self.current
    }

    fn drive(&self) -> (bool, Tristate<bool>) {
        match self.current {
            Some((PifStep::Bit(write), elapsed)) if elapsed < self.half_period => {
                let dio = match write {
                    Some(false) => Tristate::driven(false),
                    _ => Tristate::released(true),
                };
                (false, dio)
            }
            _ => (true, Tristate::released(true)),
        }
    }

    pub fn next_pins(&mut self) -> CicPins {
        if let Some((PifStep::Reset(_), 0)) = self.step() {
            self.cold_reset = false;
        }
        let (dclk, dio) = self.drive();
        CicPins {
            dclk,
            dio: dio.wired_and(&self.cart_dio),
            cold_reset: self.cold_reset,
        }
    }

    pub fn observe(&mut self, cart_dio: Tristate<bool>) {
        self.cart_dio = cart_dio;
        let (_, drive) = self.drive();
        let Some((step, elapsed)) = self.current.as_mut() else {
            return;
        };
        *elapsed += 1;
        match *step {
            PifStep::Reset(ticks) => {
                if *elapsed >= ticks {
                    self.cold_reset = true;
                    self.current = None;
                }
            }
            PifStep::Bit(_) => {
                if *elapsed == self.half_period {
                    self.bits.push(drive.wired_and(&cart_dio));
                }
                if *elapsed >= self.half_period * 2 {
                    self.current = None;
                }
            }
        }
    }
}

/// Step `system` until both drivers have finished their queues. Returns the
/// number of ticks taken.
pub fn run(
    system: &mut CartSystem,
    pi: &mut PiMaster,
    mut pif: Option<&mut PifDriver>,
    limit: u64,
) -> Result<u64, CartError> {
    let mut ticks = 0;
    let mut cic = CicPins {
        cold_reset: true,
        ..CicPins::default()
    };
    while !pi.is_idle() || pif.as_ref().is_some_and(|p| !p.is_idle()) {
        if ticks >= limit {
            return Err(CartError::Timeout(limit));
        }
        if let Some(driver) = pif.as_mut() {
            cic = driver.next_pins();
        }
        let input = CartInputs {
            bus: pi.next_pins(),
            cic,
        };
        let CartOutputs { ad, cic_dio } = system.step(&input)?;
        pi.observe(ad);
        if let Some(driver) = pif.as_mut() {
            driver.observe(cic_dio);
        }
        ticks += 1;
    }
    Ok(ticks)
}
