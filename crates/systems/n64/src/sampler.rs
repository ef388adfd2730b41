//! Bus sampler: synchronizes the console's cartridge-edge lines and decodes
//! them into at most one event per clock.
//!
//! ## Lines
//!
//! - `ALE_H` / `ALE_L`: address latch strobes. The address half on AD is
//!   captured on the falling edge of each strobe.
//! - `/READ`, `/WRITE`: active-low cycle strobes.
//! - `AD[15:0]`: multiplexed address/data.
//!
//! Every line passes through its own synchronizer of the same depth, so the
//! relative timing of strobes and data is preserved. A pin change presented
//! at tick `t` is decoded at tick `t + depth`.

use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::signal::{Edge, SyncError, Synchronizer};
use serde::{Deserialize, Serialize};

/// Level of the AD lines when nobody drives them
pub const AD_IDLE: u16 = 0xFFFF;

/// Raw pin levels at the cartridge edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusPins {
    pub ale_h: bool,
    pub ale_l: bool,
    /// Active low
    pub read_n: bool,
    /// Active low
    pub write_n: bool,
    /// Resolved level of AD[15:0]
    pub ad: u16,
}

impl Default for BusPins {
    fn default() -> Self {
        Self {
            ale_h: false,
            ale_l: false,
            read_n: true,
            write_n: true,
            ad: AD_IDLE,
        }
    }
}

/// Synchronized lines, strobes normalised to active high
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncedLines {
    pub ale_h: bool,
    pub ale_l: bool,
    pub read: bool,
    pub write: bool,
    pub ad: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    Idle,
    AddressLatchHigh,
    AddressLatchLow,
    ReadAssert,
    ReadDeassert,
    WriteAssert,
    WriteDeassert,
    /// Read and write strobes asserted together
    Violation,
}

/// One tick's worth of decoded bus activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledBus {
    pub event: BusEvent,
    /// Synchronized AD this tick
    pub ad: u16,
    /// Synchronized AD one tick earlier, i.e. while a falling strobe was
    /// still high
    pub ad_before: u16,
    /// Edges that lost arbitration to `event` this tick
    pub coalesced: u32,
}

impl SampledBus {
    /// An event with the same AD value before and after
    pub fn event(event: BusEvent, ad: u16) -> Self {
        Self {
            event,
            ad,
            ad_before: ad,
            coalesced: 0,
        }
    }

    pub fn idle() -> Self {
        Self::event(BusEvent::Idle, AD_IDLE)
    }
}

pub struct BusSampler {
    ale_h: Synchronizer<bool>,
    ale_l: Synchronizer<bool>,
    read: Synchronizer<bool>,
    write: Synchronizer<bool>,
    ad: Synchronizer<u16>,
    current: SyncedLines,
    coalesced_total: u64,
}

impl BusSampler {
    pub fn new(depth: usize) -> Result<Self, SyncError> {
        let idle = SyncedLines {
            ad: AD_IDLE,
            ..SyncedLines::default()
        };
        Ok(Self {
            ale_h: Synchronizer::new(depth, idle.ale_h)?,
            ale_l: Synchronizer::new(depth, idle.ale_l)?,
            read: Synchronizer::new(depth, idle.read)?,
            write: Synchronizer::new(depth, idle.write)?,
            ad: Synchronizer::new(depth, idle.ad)?,
            current: idle,
            coalesced_total: 0,
        })
    }

    pub fn reset(&mut self) {
        self.ale_h.preload(false);
        self.ale_l.preload(false);
        self.read.preload(false);
        self.write.preload(false);
        self.ad.preload(AD_IDLE);
        self.current = SyncedLines {
            ad: AD_IDLE,
            ..SyncedLines::default()
        };
        self.coalesced_total = 0;
    }

    /// Synchronized lines as of the last `sample`
    pub fn lines(&self) -> SyncedLines {
        self.current
    }

    pub fn coalesced_total(&self) -> u64 {
        self.coalesced_total
    }

    /// Clock all synchronizers with this tick's pins and decode the result.
    pub fn sample(&mut self, pins: &BusPins) -> SampledBus {
        let now = SyncedLines {
            ale_h: self.ale_h.clock(pins.ale_h),
            ale_l: self.ale_l.clock(pins.ale_l),
            read: self.read.clock(!pins.read_n),
            write: self.write.clock(!pins.write_n),
            ad: self.ad.clock(pins.ad),
        };
        let prev = std::mem::replace(&mut self.current, now);

        let sampled = decode(&prev, &now);
        if sampled.coalesced > 0 {
            self.coalesced_total += sampled.coalesced as u64;
            log(LogCategory::Bus, LogLevel::Debug, || {
                format!(
                    "bus: {} edge(s) coalesced into {:?}",
                    sampled.coalesced, sampled.event
                )
            });
        }
        if sampled.event == BusEvent::Violation {
            log(LogCategory::Bus, LogLevel::Warn, || {
                "bus: read and write strobes asserted together".to_string()
            });
        }
        sampled
    }
}

/// Pick the single event for this tick.
///
/// Priority: violation, ALE_H, ALE_L, strobe deasserts, strobe asserts.
fn decode(prev: &SyncedLines, now: &SyncedLines) -> SampledBus {
    let both_now = now.read && now.write;
    let both_prev = prev.read && prev.write;

    let read_edge = Edge::between(prev.read, now.read);
    let write_edge = Edge::between(prev.write, now.write);

    let candidates = [
        (both_now && !both_prev, BusEvent::Violation),
        (
            Edge::between(prev.ale_h, now.ale_h) == Edge::Falling,
            BusEvent::AddressLatchHigh,
        ),
        (
            Edge::between(prev.ale_l, now.ale_l) == Edge::Falling,
            BusEvent::AddressLatchLow,
        ),
        (read_edge == Edge::Falling, BusEvent::ReadDeassert),
        (write_edge == Edge::Falling, BusEvent::WriteDeassert),
        (read_edge == Edge::Rising && !both_now, BusEvent::ReadAssert),
        (write_edge == Edge::Rising && !both_now, BusEvent::WriteAssert),
    ];

    let mut hits = candidates
        .iter()
        .filter(|(hit, _)| *hit)
        .map(|(_, event)| *event);
    let event = hits.next().unwrap_or(BusEvent::Idle);
    let coalesced = hits.count() as u32;

    SampledBus {
        event,
        ad: now.ad,
        ad_before: prev.ad,
        coalesced,
    }
}
