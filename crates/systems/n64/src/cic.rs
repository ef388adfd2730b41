//! CIC lockout chip emulation on the sideband lines.
//!
//! The console's PIF clocks a serial exchange over two lines: DCLK (driven
//! by the PIF) and DIO (open drain, either side may pull it low). Every
//! DCLK falling edge carries one bit. When the CIC sends a `0` it pulls DIO
//! low until DCLK rises again; a `1` leaves the line released. When the CIC
//! receives, it samples DIO at the falling edge.
//!
//! After cold reset is released the CIC announces itself:
//!
//! 1. hello nibble (`0x1`, `0x5` on PAL consoles)
//! 2. the encoded seed (6 nibbles)
//! 3. a `0` bit, then the encoded checksum (16 nibbles)
//!
//! then reads two nibbles of key material from the PIF and serves 2-bit
//! commands until told to stop:
//!
//! | Command | Action |
//! |---------|--------|
//! | `00` | compare: answer the PIF's bits from scrambled RAM |
//! | `10` | 6105 challenge/response |
//! | `11` | reset acknowledge |
//! | `01` | stop |
//!
//! Each bit operation is queued and consumed by one falling edge, so the
//! exchange advances exactly as fast as the PIF clocks it.

use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::signal::{Edge, SyncError, Synchronizer, Tristate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const RAM_INIT_NTSC: [u8; 32] = [
    0xE, 0x0, 0x9, 0xA, 0x1, 0x8, 0x5, 0xA, 0x1, 0x3, 0xE, 0x1, 0x0, 0xD, 0xE, 0xC, //
    0x0, 0xB, 0x1, 0x4, 0xF, 0x8, 0xB, 0x5, 0x7, 0xC, 0xD, 0x6, 0x1, 0xE, 0x9, 0x8,
];

const RAM_INIT_PAL: [u8; 32] = [
    0xE, 0x0, 0x4, 0xF, 0x5, 0x1, 0x2, 0x1, 0x7, 0x1, 0x9, 0x8, 0x5, 0x7, 0x5, 0xA, //
    0x0, 0xB, 0x1, 0x2, 0x3, 0xF, 0x8, 0x2, 0x7, 0x1, 0x9, 0x8, 0x1, 0x1, 0x5, 0xC,
];

/// Nibbles exchanged in each direction of a 6105 challenge
pub const CHALLENGE_NIBBLES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CicVariant {
    Cic6101,
    /// Also 7101
    #[default]
    Cic6102,
    /// Also 7103
    Cic6103,
    /// Also 7105
    Cic6105,
    /// Also 7106
    Cic6106,
    Cic7102,
}

impl CicVariant {
    pub const ALL: [CicVariant; 6] = [
        CicVariant::Cic6101,
        CicVariant::Cic6102,
        CicVariant::Cic6103,
        CicVariant::Cic6105,
        CicVariant::Cic6106,
        CicVariant::Cic7102,
    ];

    /// Accepts chip numbers such as `"6102"` or `"7105"`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_start_matches("cic").trim_start_matches("CIC") {
            "6101" => Some(CicVariant::Cic6101),
            "6102" | "7101" => Some(CicVariant::Cic6102),
            "6103" | "7103" => Some(CicVariant::Cic6103),
            "6105" | "7105" => Some(CicVariant::Cic6105),
            "6106" | "7106" => Some(CicVariant::Cic6106),
            "7102" => Some(CicVariant::Cic7102),
            _ => None,
        }
    }

    pub fn seed(self) -> u8 {
        match self {
            CicVariant::Cic6101 | CicVariant::Cic6102 | CicVariant::Cic7102 => 0x3F,
            CicVariant::Cic6103 => 0x78,
            CicVariant::Cic6105 => 0x91,
            CicVariant::Cic6106 => 0x85,
        }
    }

    pub fn checksum(self) -> [u8; 12] {
        match self {
            CicVariant::Cic6101 => [0x4, 0x5, 0xC, 0xC, 0x7, 0x3, 0xE, 0xE, 0x3, 0x1, 0x7, 0xA],
            CicVariant::Cic6102 => [0xA, 0x5, 0x3, 0x6, 0xC, 0x0, 0xF, 0x1, 0xD, 0x8, 0x5, 0x9],
            CicVariant::Cic6103 => [0x5, 0x8, 0x6, 0xF, 0xD, 0x4, 0x7, 0x0, 0x9, 0x8, 0x6, 0x7],
            CicVariant::Cic6105 => [0x8, 0x6, 0x1, 0x8, 0xA, 0x4, 0x5, 0xB, 0xC, 0x2, 0xD, 0x3],
            CicVariant::Cic6106 => [0x2, 0xB, 0xB, 0xA, 0xD, 0x4, 0xE, 0x6, 0xE, 0xB, 0x7, 0x4],
            CicVariant::Cic7102 => [0x4, 0x4, 0x1, 0x6, 0x0, 0xE, 0xC, 0x5, 0xD, 0x9, 0xA, 0xF],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoRegion {
    #[default]
    Ntsc,
    Pal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CicConfig {
    pub variant: CicVariant,
    pub region: VideoRegion,
    /// Synchronizer depth on DCLK, DIO and cold reset
    pub sync_stages: usize,
}

impl Default for CicConfig {
    fn default() -> Self {
        Self {
            variant: CicVariant::default(),
            region: VideoRegion::default(),
            sync_stages: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CicPhase {
    /// Cold reset asserted or held by the control block
    #[default]
    Held,
    /// Sending hello, seed and checksum
    Handshake,
    /// Reading the two key nibbles
    ReadInit,
    /// Waiting for a 2-bit command
    Command,
    Compare,
    /// Reading the 6105 challenge
    Challenge,
    ChallengeReply,
    ResetAck,
    Stopped,
}

impl CicPhase {
    pub fn code(self) -> u8 {
        match self {
            CicPhase::Held => 0,
            CicPhase::Handshake => 1,
            CicPhase::ReadInit => 2,
            CicPhase::Command => 3,
            CicPhase::Compare => 4,
            CicPhase::Challenge => 5,
            CicPhase::ChallengeReply => 6,
            CicPhase::ResetAck => 7,
            CicPhase::Stopped => 8,
        }
    }
}

/// Sideband pin levels as seen at the cartridge edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CicPins {
    pub dclk: bool,
    /// Resolved level of the open-drain DIO line
    pub dio: bool,
    /// Active low
    pub cold_reset: bool,
}

impl Default for CicPins {
    fn default() -> Self {
        Self {
            dclk: true,
            dio: true,
            cold_reset: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOp {
    Write(bool),
    Read,
}

pub struct Cic {
    config: CicConfig,
    ram: [u8; 32],
    challenge: [u8; 32],
    phase: CicPhase,
    ops: VecDeque<BitOp>,
    received: Vec<bool>,
    dclk: Synchronizer<bool>,
    dio: Synchronizer<bool>,
    cold_reset: Synchronizer<bool>,
    prev_dclk: bool,
    dio_in: bool,
    dio_out: Tristate<bool>,
    bits_written: u64,
    bits_read: u64,
}

impl Cic {
    pub fn new(config: CicConfig) -> Result<Self, SyncError> {
        let idle = CicPins::default();
        Ok(Self {
            dclk: Synchronizer::new(config.sync_stages, idle.dclk)?,
            dio: Synchronizer::new(config.sync_stages, idle.dio)?,
            cold_reset: Synchronizer::new(config.sync_stages, idle.cold_reset)?,
            config,
            ram: [0; 32],
            challenge: [0; 32],
            phase: CicPhase::Held,
            ops: VecDeque::new(),
            received: Vec::new(),
            prev_dclk: idle.dclk,
            dio_in: idle.dio,
            dio_out: Tristate::released(true),
            bits_written: 0,
            bits_read: 0,
        })
    }

    pub fn reset(&mut self) {
        let idle = CicPins::default();
        self.dclk.preload(idle.dclk);
        self.dio.preload(idle.dio);
        self.cold_reset.preload(idle.cold_reset);
        self.prev_dclk = idle.dclk;
        self.dio_in = idle.dio;
        self.enter_held();
        self.bits_written = 0;
        self.bits_read = 0;
    }

    pub fn config(&self) -> &CicConfig {
        &self.config
    }

    pub fn phase(&self) -> CicPhase {
        self.phase
    }

    pub fn output(&self) -> Tristate<bool> {
        self.dio_out
    }

    /// Synchronized DCLK as of the last tick
    pub fn dclk(&self) -> bool {
        self.prev_dclk
    }

    /// Synchronized DIO as of the last tick
    pub fn dio_in(&self) -> bool {
        self.dio_in
    }

    pub fn bit_counts(&self) -> (u64, u64) {
        (self.bits_written, self.bits_read)
    }

    /// Status word mirrored into the control block.
    ///
    /// bit 0 DCLK, bit 1 DIO in, bit 2 DIO out, bit 3 DIO drive,
    /// bits 8..15 phase.
    pub fn status_word(&self) -> u32 {
        (self.prev_dclk as u32)
            | (self.dio_in as u32) << 1
            | (self.dio_out.value as u32) << 2
            | (self.dio_out.drive as u32) << 3
            | (self.phase.code() as u32) << 8
    }

    /// Advance one clock. `hold` keeps the chip in reset regardless of the
    /// cold-reset line.
    pub fn tick(&mut self, pins: &CicPins, hold: bool) -> Tristate<bool> {
        let dclk = self.dclk.clock(pins.dclk);
        self.dio_in = self.dio.clock(pins.dio);
        let running = self.cold_reset.clock(pins.cold_reset) && !hold;

        if !running {
            if self.phase != CicPhase::Held {
                log(LogCategory::Cic, LogLevel::Info, || {
                    "cic: reset, sequence aborted".to_string()
                });
                self.enter_held();
            }
            self.prev_dclk = dclk;
            return self.dio_out;
        }

        if self.phase == CicPhase::Held {
            self.start();
        }

        match Edge::between(self.prev_dclk, dclk) {
            Edge::Falling => self.on_falling_edge(),
            Edge::Rising => self.dio_out = Tristate::released(true),
            Edge::None => {}
        }
        self.prev_dclk = dclk;
        self.dio_out
    }

    fn enter_held(&mut self) {
        self.phase = CicPhase::Held;
        self.ops.clear();
        self.received.clear();
        self.dio_out = Tristate::released(true);
    }

    fn start(&mut self) {
        let (variant, region) = (self.config.variant, self.config.region);
        log(LogCategory::Cic, LogLevel::Info, || {
            format!("cic: {:?} ({:?}) starting handshake", variant, region)
        });
        self.ram = [0; 32];
        self.challenge = [0; 32];
        self.ops.clear();
        self.received.clear();

        let hello = match region {
            VideoRegion::Ntsc => 0x1,
            VideoRegion::Pal => 0x1 | 0x4,
        };
        self.queue_nibble(hello);

        let seed = variant.seed();
        self.ram[0x0A] = 0xB;
        self.ram[0x0B] = 0x5;
        self.ram[0x0C] = seed >> 4;
        self.ram[0x0D] = seed;
        self.ram[0x0E] = seed >> 4;
        self.ram[0x0F] = seed;
        encode_round(&mut self.ram, 0x0A);
        encode_round(&mut self.ram, 0x0A);
        self.queue_ram_nibbles(0x0A);

        self.ram[0x04..0x10].copy_from_slice(&variant.checksum());
        for _ in 0..4 {
            encode_round(&mut self.ram, 0x00);
        }
        self.ops.push_back(BitOp::Write(false));
        self.queue_ram_nibbles(0x00);

        self.phase = CicPhase::Handshake;
    }

    fn on_falling_edge(&mut self) {
        let Some(op) = self.ops.pop_front() else {
            return;
        };
        match op {
            BitOp::Write(bit) => {
                if !bit {
                    self.dio_out = Tristate::driven(false);
                }
                self.bits_written += 1;
            }
            BitOp::Read => {
                self.received.push(self.dio_in);
                self.bits_read += 1;
            }
        }
        if self.ops.is_empty() {
            self.advance();
        }
    }

    /// Current step's bit operations are done; queue the next step.
    fn advance(&mut self) {
        let received = std::mem::take(&mut self.received);
        match self.phase {
            CicPhase::Handshake => {
                self.ram = match self.config.region {
                    VideoRegion::Ntsc => RAM_INIT_NTSC,
                    VideoRegion::Pal => RAM_INIT_PAL,
                };
                self.queue_reads(8);
                self.phase = CicPhase::ReadInit;
            }
            CicPhase::ReadInit => {
                self.ram[0x01] = nibble(&received[0..4]);
                self.ram[0x11] = nibble(&received[4..8]);
                self.await_command();
            }
            CicPhase::Command => {
                let command = (received[0] as u8) << 1 | received[1] as u8;
                self.run_command(command);
            }
            CicPhase::Challenge => {
                for (i, bits) in received.chunks(4).take(CHALLENGE_NIBBLES).enumerate() {
                    self.challenge[i] = nibble(bits);
                }
                cic_6105(&mut self.challenge);
                self.ops.push_back(BitOp::Write(false));
                for i in 0..CHALLENGE_NIBBLES {
                    self.queue_nibble(self.challenge[i]);
                }
                self.phase = CicPhase::ChallengeReply;
            }
            CicPhase::Compare | CicPhase::ChallengeReply | CicPhase::ResetAck => {
                self.await_command();
            }
            CicPhase::Held | CicPhase::Stopped => {}
        }
    }

    fn await_command(&mut self) {
        self.queue_reads(2);
        self.phase = CicPhase::Command;
    }

    fn run_command(&mut self, command: u8) {
        log(LogCategory::Cic, LogLevel::Debug, || {
            format!("cic: command {:02b}", command)
        });
        match command {
            0b00 => {
                for _ in 0..3 {
                    cic_round(&mut self.ram[0x10..]);
                }
                let mut index = (self.ram[0x17] & 0xF) as usize;
                if index == 0 {
                    index = 1;
                }
                index |= 0x10;
                loop {
                    self.ops.push_back(BitOp::Read);
                    self.ops.push_back(BitOp::Write(self.ram[index] & 1 != 0));
                    index = match self.config.region {
                        VideoRegion::Ntsc => index + 1,
                        VideoRegion::Pal => index - 1,
                    };
                    if index & 0xF == 0 {
                        break;
                    }
                }
                self.phase = CicPhase::Compare;
            }
            0b10 => {
                self.queue_nibble(0xA);
                self.queue_nibble(0xA);
                self.queue_reads(CHALLENGE_NIBBLES * 4);
                self.phase = CicPhase::Challenge;
            }
            0b11 => {
                self.ops.push_back(BitOp::Write(false));
                self.phase = CicPhase::ResetAck;
            }
            _ => {
                log(LogCategory::Cic, LogLevel::Info, || {
                    "cic: stop command".to_string()
                });
                self.phase = CicPhase::Stopped;
            }
        }
    }

    fn queue_nibble(&mut self, value: u8) {
        for shift in (0..4).rev() {
            self.ops.push_back(BitOp::Write((value >> shift) & 1 != 0));
        }
    }

    /// Queue RAM nibbles from `index` up to the next 16-nibble boundary.
    fn queue_ram_nibbles(&mut self, mut index: usize) {
        loop {
            self.queue_nibble(self.ram[index]);
            index += 1;
            if index & 0xF == 0 {
                break;
            }
        }
    }

    fn queue_reads(&mut self, count: usize) {
        self.ops.extend(std::iter::repeat(BitOp::Read).take(count));
    }
}

/// MSB-first bits to a nibble
fn nibble(bits: &[bool]) -> u8 {
    bits.iter().fold(0, |acc, &bit| acc << 1 | bit as u8)
}

/// Seed/checksum scrambling: chain-add from `index` to the next 16-nibble
/// boundary.
pub fn encode_round(ram: &mut [u8; 32], index: usize) {
    let mut a = ram[index];
    let mut i = index + 1;
    loop {
        a = (a + 1) & 0xF;
        a = (a + ram[i]) & 0xF;
        ram[i] = a;
        i += 1;
        if i & 0xF == 0 {
            break;
        }
    }
}

/// Compare-mode RAM scrambling over a 16-entry bank.
///
/// Works on full bytes with wrapping arithmetic; only bit 0 of the result
/// is ever sent.
pub fn cic_round(m: &mut [u8]) {
    debug_assert_eq!(m.len(), 16);
    let mut x = m[15];
    let mut a = x;
    loop {
        let mut b = 1;
        a = a.wrapping_add(m[b]).wrapping_add(1);
        m[b] = a;
        b += 1;
        a = a.wrapping_add(m[b]).wrapping_add(1);
        std::mem::swap(&mut a, &mut m[b]);
        m[b] = !m[b];
        b += 1;
        a &= 0xF;
        a = a.wrapping_add(m[b] & 0xF).wrapping_add(1);
        if a < 16 {
            std::mem::swap(&mut a, &mut m[b]);
            b += 1;
        }
        a = a.wrapping_add(m[b]);
        m[b] = a;
        b += 1;
        a = a.wrapping_add(m[b]);
        std::mem::swap(&mut a, &mut m[b]);
        b += 1;
        a &= 0xF;
        a = a.wrapping_add(8);
        if a < 16 {
            a = a.wrapping_add(m[b]);
        }
        std::mem::swap(&mut a, &mut m[b]);
        b += 1;
        loop {
            a = a.wrapping_add(m[b]).wrapping_add(1);
            m[b] = a;
            b = (b + 1) & 0xF;
            if b == 0 {
                break;
            }
        }
        a = x.wrapping_add(0xF);
        x = a & 0xF;
        if x == 15 {
            break;
        }
    }
}

/// 6105 challenge response, in place over the first 30 nibbles.
pub fn cic_6105(mem: &mut [u8; 32]) {
    let mut a: u8 = 5;
    let mut carry: u8 = 1;
    for value in mem.iter_mut().take(CHALLENGE_NIBBLES) {
        if *value & 1 == 0 {
            a = a.wrapping_add(8);
        }
        if a & 2 == 0 {
            a = a.wrapping_add(4);
        }
        a = a.wrapping_add(*value) & 0xF;
        *value = a;
        if carry == 0 {
            a = a.wrapping_add(7);
        }
        a = a.wrapping_add(*value) & 0xF;
        a = a.wrapping_add(*value).wrapping_add(carry);
        if a >= 0x10 {
            carry = 1;
            a -= 0x10;
        } else {
            carry = 0;
        }
        a = !a & 0xF;
        *value = a;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_6102: [u8; 6] = [0xB, 0xD, 0x3, 0x9, 0x3, 0xD];
    const CHECKSUM_6102: [u8; 16] = [
        0x0, 0x4, 0xE, 0x2, 0xF, 0xA, 0xC, 0x5, 0x2, 0x1, 0x0, 0xF, 0xC, 0xE, 0x2, 0xF,
    ];

    /// Minimal PIF: clocks DCLK with four ticks per half period.
    struct Pif {
        cic: Cic,
        cic_out: Tristate<bool>,
    }

    impl Pif {
        fn new(config: CicConfig) -> Self {
            let mut pif = Self {
                cic: Cic::new(config).unwrap(),
                cic_out: Tristate::released(true),
            };
            for _ in 0..4 {
                pif.clock(true, Tristate::released(true), false);
            }
            pif.clock(true, Tristate::released(true), true);
            pif
        }

        fn clock(&mut self, dclk: bool, drive: Tristate<bool>, reset: bool) -> bool {
            let pins = CicPins {
                dclk,
                dio: drive.wired_and(&self.cic_out),
                cold_reset: reset,
            };
            self.cic_out = self.cic.tick(&pins, false);
            drive.wired_and(&self.cic_out)
        }

        fn bit(&mut self, write: Option<bool>) -> bool {
            let drive = match write {
                Some(false) => Tristate::driven(false),
                _ => Tristate::released(true),
            };
            let mut line = true;
            for _ in 0..4 {
                line = self.clock(false, drive, true);
            }
            for _ in 0..4 {
                self.clock(true, Tristate::released(true), true);
            }
            line
        }

        fn read_bits(&mut self, count: usize) -> Vec<bool> {
            (0..count).map(|_| self.bit(None)).collect()
        }

        fn read_nibbles(&mut self, count: usize) -> Vec<u8> {
            (0..count).map(|_| nibble(&self.read_bits(4))).collect()
        }

        fn write_nibble(&mut self, value: u8) {
            for shift in (0..4).rev() {
                self.bit(Some((value >> shift) & 1 != 0));
            }
        }

        fn command(&mut self, high: bool, low: bool) {
            self.bit(Some(high));
            self.bit(Some(low));
        }

        /// Hello, seed, checksum, then the two key nibbles
        fn boot(&mut self, n1: u8, n2: u8) -> (u8, Vec<u8>, Vec<u8>) {
            let hello = self.read_nibbles(1)[0];
            let seed = self.read_nibbles(6);
            assert!(!self.bit(None), "checksum marker bit");
            let checksum = self.read_nibbles(16);
            self.write_nibble(n1);
            self.write_nibble(n2);
            (hello, seed, checksum)
        }
    }

    #[test]
    fn test_encode_seed() {
        let mut ram = [0u8; 32];
        ram[0x0A] = 0xB;
        ram[0x0B] = 0x5;
        ram[0x0C] = 0x3;
        ram[0x0D] = 0x3F;
        ram[0x0E] = 0x3;
        ram[0x0F] = 0x3F;
        encode_round(&mut ram, 0x0A);
        encode_round(&mut ram, 0x0A);
        assert_eq!(ram[0x0A..0x10], SEED_6102);
    }

    #[test]
    fn test_6105_algorithm() {
        let mut mem = [0u8; 32];
        for (i, value) in mem.iter_mut().take(30).enumerate() {
            *value = (i & 0xF) as u8;
        }
        cic_6105(&mut mem);
        assert_eq!(
            mem[..30],
            [
                11, 4, 8, 11, 9, 8, 10, 11, 7, 14, 8, 3, 3, 8, 2, 5, 5, 10, 2, 9, 13, 12, 4, 1,
                15, 6, 0, 11, 1, 8
            ]
        );
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(CicVariant::from_name("6102"), Some(CicVariant::Cic6102));
        assert_eq!(CicVariant::from_name("7101"), Some(CicVariant::Cic6102));
        assert_eq!(CicVariant::from_name("cic6105"), Some(CicVariant::Cic6105));
        assert_eq!(CicVariant::from_name("1234"), None);
        for variant in CicVariant::ALL {
            assert!(variant.checksum().iter().all(|&n| n <= 0xF));
        }
    }

    #[test]
    fn test_held_while_reset_low() {
        let mut cic = Cic::new(CicConfig::default()).unwrap();
        for _ in 0..10 {
            let out = cic.tick(&CicPins::default(), false);
            assert!(!out.drive);
        }
        assert_eq!(cic.phase(), CicPhase::Held);
    }

    #[test]
    fn test_ntsc_handshake() {
        let mut pif = Pif::new(CicConfig::default());
        let (hello, seed, checksum) = pif.boot(0x3, 0x7);
        assert_eq!(hello, 0x1);
        assert_eq!(seed, SEED_6102);
        assert_eq!(checksum, CHECKSUM_6102);
        assert_eq!(pif.cic.phase(), CicPhase::Command);
    }

    #[test]
    fn test_pal_hello() {
        let mut pif = Pif::new(CicConfig {
            region: VideoRegion::Pal,
            ..CicConfig::default()
        });
        let (hello, seed, _) = pif.boot(0x3, 0x7);
        assert_eq!(hello, 0x5);
        assert_eq!(seed, SEED_6102);
    }

    #[test]
    fn test_other_variant_seed() {
        let mut pif = Pif::new(CicConfig {
            variant: CicVariant::Cic6105,
            ..CicConfig::default()
        });
        let (_, seed, checksum) = pif.boot(0, 0);
        assert_eq!(seed, [0xB, 0xD, 0x9, 0x7, 0xF, 0x9]);
        assert_eq!(
            checksum,
            [0x0, 0x4, 0xE, 0x2, 0xD, 0x3, 0xA, 0x1, 0x2, 0xC, 0x4, 0xB, 0xF, 0x1, 0x0, 0xF]
        );
    }

    fn compare_bits(region: VideoRegion) -> Vec<bool> {
        let mut pif = Pif::new(CicConfig {
            region,
            ..CicConfig::default()
        });
        pif.boot(0x3, 0x7);
        pif.command(false, false);
        assert_eq!(pif.cic.phase(), CicPhase::Compare);
        let mut bits = Vec::new();
        while pif.cic.phase() == CicPhase::Compare {
            pif.bit(Some(true));
            bits.push(pif.bit(None));
        }
        bits
    }

    #[test]
    fn test_compare_mode_ntsc() {
        let expected = [1, 1, 1, 0, 1, 0, 1].map(|b| b == 1);
        assert_eq!(compare_bits(VideoRegion::Ntsc), expected);
    }

    #[test]
    fn test_compare_mode_pal() {
        let expected = [0, 1, 1, 0, 0, 0, 0, 0, 1].map(|b| b == 1);
        assert_eq!(compare_bits(VideoRegion::Pal), expected);
    }

    #[test]
    fn test_reset_ack_and_challenge() {
        let mut pif = Pif::new(CicConfig::default());
        pif.boot(0x3, 0x7);

        pif.command(true, true);
        assert!(!pif.bit(None));
        assert_eq!(pif.cic.phase(), CicPhase::Command);

        pif.command(true, false);
        assert_eq!(pif.read_nibbles(2), vec![0xA, 0xA]);
        for i in 0..30u8 {
            pif.write_nibble(i & 0xF);
        }
        assert!(!pif.bit(None));
        let response = pif.read_nibbles(30);
        assert_eq!(
            response,
            vec![
                11, 4, 8, 11, 9, 8, 10, 11, 7, 14, 8, 3, 3, 8, 2, 5, 5, 10, 2, 9, 13, 12, 4, 1,
                15, 6, 0, 11, 1, 8
            ]
        );
        assert_eq!(pif.cic.phase(), CicPhase::Command);

        pif.command(false, true);
        assert_eq!(pif.cic.phase(), CicPhase::Stopped);
        assert!(pif.read_bits(4).iter().all(|&b| b));
    }

    #[test]
    fn test_cold_reset_restarts_sequence() {
        let mut pif = Pif::new(CicConfig::default());
        pif.read_nibbles(3);
        for _ in 0..4 {
            pif.clock(true, Tristate::released(true), false);
        }
        assert_eq!(pif.cic.phase(), CicPhase::Held);
        pif.clock(true, Tristate::released(true), true);
        let (hello, seed, _) = pif.boot(0, 0);
        assert_eq!(hello, 0x1);
        assert_eq!(seed, SEED_6102);
    }

    #[test]
    fn test_hold_bit_keeps_chip_in_reset() {
        let mut cic = Cic::new(CicConfig::default()).unwrap();
        let running = CicPins {
            cold_reset: true,
            ..CicPins::default()
        };
        for _ in 0..4 {
            cic.tick(&running, true);
        }
        assert_eq!(cic.phase(), CicPhase::Held);
        for _ in 0..4 {
            cic.tick(&running, false);
        }
        assert_eq!(cic.phase(), CicPhase::Handshake);
    }

    #[test]
    fn test_status_word() {
        let mut cic = Cic::new(CicConfig::default()).unwrap();
        let running = CicPins {
            cold_reset: true,
            ..CicPins::default()
        };
        for _ in 0..4 {
            cic.tick(&running, false);
        }
        let status = cic.status_word();
        assert_eq!(status & 0b11, 0b11);
        assert_eq!(status >> 8, CicPhase::Handshake.code() as u32);
    }
}
