//! Diagnostics tap: per-tick snapshots of the bridge for a logic-analyzer
//! style capture.
//!
//! A sample is built from shared references only, so taking one can never
//! change what the bridge does next.

use crate::bridge::{Bridge, BridgeState};
use crate::cic::Cic;
use crate::latch::Region;
use crate::sampler::BusSampler;
use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::port::{MemoryOp, RequestTarget};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;

pub const DEFAULT_CAPTURE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapSample {
    pub tick: u64,
    pub state: BridgeState,
    pub addr_high: u16,
    pub addr_low: u16,
    pub addr_valid: bool,
    pub ale_h: bool,
    pub ale_l: bool,
    pub read: bool,
    pub write: bool,
    pub ad_in: u16,
    pub ad_out: u16,
    pub ad_oe: bool,
    pub backing_sel: bool,
    pub control_sel: bool,
    pub req_submitted: bool,
    pub req_write: bool,
    pub req_address: u32,
    pub port_busy: bool,
    pub resp_valid: bool,
    pub resp_data: u16,
    /// Protocol violation detected this tick
    pub violation: bool,
    /// Read ran past its access budget this tick
    pub overrun: bool,
    pub cic_dclk: bool,
    pub cic_dio_in: bool,
    pub cic_dio_out: bool,
    pub cic_dio_oe: bool,
}

/// Signal names in the order `TapSample::signals` returns them
pub const SIGNAL_NAMES: [&str; 25] = [
    "state",
    "addr_high",
    "addr_low",
    "addr_valid",
    "ale_h",
    "ale_l",
    "read",
    "write",
    "ad_in",
    "ad_out",
    "ad_oe",
    "backing_sel",
    "control_sel",
    "req_submitted",
    "req_write",
    "req_address",
    "port_busy",
    "resp_valid",
    "resp_data",
    "violation",
    "overrun",
    "cic_dclk",
    "cic_dio_in",
    "cic_dio_out",
    "cic_dio_oe",
];

impl TapSample {
    pub fn capture(tick: u64, sampler: &BusSampler, bridge: &Bridge, cic: &Cic) -> Self {
        let lines = sampler.lines();
        let latch = bridge.latch();
        let output = bridge.output();
        let handshake = bridge.handshake();
        let region = bridge
            .transaction()
            .map(|txn| txn.region)
            .unwrap_or_default();
        let cic_out = cic.output();

        Self {
            tick,
            state: bridge.state(),
            addr_high: latch.high(),
            addr_low: latch.low(),
            addr_valid: latch.is_valid(),
            ale_h: lines.ale_h,
            ale_l: lines.ale_l,
            read: lines.read,
            write: lines.write,
            ad_in: lines.ad,
            ad_out: output.value,
            ad_oe: output.drive,
            backing_sel: region == Region::BackingStore,
            control_sel: region == Region::Control,
            req_submitted: handshake.submitted.is_some(),
            req_write: handshake
                .submitted
                .is_some_and(|r| r.op == MemoryOp::Write),
            req_address: handshake.submitted.map_or(0, |r| match r.target {
                RequestTarget::BackingStore => r.address,
                RequestTarget::Control => r.address | 0x8000_0000,
            }),
            port_busy: handshake.busy,
            resp_valid: handshake.completed,
            resp_data: handshake.data.unwrap_or(0),
            violation: handshake.violation,
            overrun: handshake.overrun,
            cic_dclk: cic.dclk(),
            cic_dio_in: cic.dio_in(),
            cic_dio_out: cic_out.value,
            cic_dio_oe: cic_out.drive,
        }
    }

    /// Named signal values, ordered as `SIGNAL_NAMES`
    pub fn signals(&self) -> Vec<(&'static str, u32)> {
        let values = [
            self.state.code() as u32,
            self.addr_high as u32,
            self.addr_low as u32,
            self.addr_valid as u32,
            self.ale_h as u32,
            self.ale_l as u32,
            self.read as u32,
            self.write as u32,
            self.ad_in as u32,
            self.ad_out as u32,
            self.ad_oe as u32,
            self.backing_sel as u32,
            self.control_sel as u32,
            self.req_submitted as u32,
            self.req_write as u32,
            self.req_address,
            self.port_busy as u32,
            self.resp_valid as u32,
            self.resp_data as u32,
            self.violation as u32,
            self.overrun as u32,
            self.cic_dclk as u32,
            self.cic_dio_in as u32,
            self.cic_dio_out as u32,
            self.cic_dio_oe as u32,
        ];
        SIGNAL_NAMES.iter().copied().zip(values).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Trigger {
    /// Record from the first tick
    #[default]
    Immediate,
    /// Start recording the first time the bridge leaves Idle
    BridgeActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub depth: usize,
    pub trigger: Trigger,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_CAPTURE_DEPTH,
            trigger: Trigger::default(),
        }
    }
}

/// Ring buffer of the most recent samples
pub struct Capture {
    config: CaptureConfig,
    samples: VecDeque<TapSample>,
    armed: bool,
    total: u64,
}

impl Capture {
    pub fn new(config: CaptureConfig) -> Self {
        let armed = config.trigger == Trigger::Immediate;
        Self {
            samples: VecDeque::with_capacity(config.depth),
            config,
            armed,
            total: 0,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.armed = self.config.trigger == Trigger::Immediate;
        self.total = 0;
    }

    pub fn record(&mut self, sample: TapSample) {
        if !self.armed {
            if sample.state == BridgeState::Idle {
                return;
            }
            self.armed = true;
            log(LogCategory::Diagnostics, LogLevel::Debug, || {
                format!("tap: triggered at tick {}", sample.tick)
            });
        }
        if self.config.depth == 0 {
            return;
        }
        if self.samples.len() == self.config.depth {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total += 1;
    }

    pub fn is_triggered(&self) -> bool {
        self.armed
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples recorded since the trigger, including ones pushed out
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    pub fn samples(&self) -> impl Iterator<Item = &TapSample> {
        self.samples.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "depth": self.config.depth,
            "total_recorded": self.total,
            "signals": SIGNAL_NAMES,
            "samples": self.samples.iter().collect::<Vec<_>>(),
        })
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("tick");
        for name in SIGNAL_NAMES {
            out.push(',');
            out.push_str(name);
        }
        out.push('\n');
        for sample in &self.samples {
            let _ = write!(out, "{}", sample.tick);
            for (_, value) in sample.signals() {
                let _ = write!(out, ",{}", value);
            }
            out.push('\n');
        }
        out
    }
}
