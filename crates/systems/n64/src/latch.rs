//! Address latch and region decode.

use serde::{Deserialize, Serialize};

/// Destination of a decoded address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Region {
    /// Cartridge ROM window, served from the backing store
    BackingStore,
    /// Control/status word file
    Control,
    /// Nothing answers; the bus is left released
    #[default]
    Unmapped,
}

/// Address map keyed on the latched high half.
///
/// Domain 1 address 2 on the console side starts at `0x1000_0000`; the top
/// of that window is claimed for the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionMap {
    pub rom_first_high: u16,
    pub rom_last_high: u16,
    pub control_high: u16,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self {
            rom_first_high: 0x1000,
            rom_last_high: 0x1FBF,
            control_high: 0x1FFF,
        }
    }
}

impl RegionMap {
    pub fn decode(&self, high: u16) -> Region {
        if high == self.control_high {
            Region::Control
        } else if (self.rom_first_high..=self.rom_last_high).contains(&high) {
            Region::BackingStore
        } else {
            Region::Unmapped
        }
    }

    /// Byte address of the first ROM byte
    pub fn rom_base(&self) -> u32 {
        (self.rom_first_high as u32) << 16
    }

    /// Bytes covered by the ROM window
    pub fn rom_window(&self) -> u32 {
        (self.rom_last_high as u32 + 1 - self.rom_first_high as u32) << 16
    }

    /// Translate a bus address into a word offset inside its region.
    pub fn word_offset(&self, region: Region, address: u32) -> Option<u32> {
        match region {
            Region::BackingStore => Some(address.wrapping_sub(self.rom_base()) >> 1),
            Region::Control => Some((address & 0xFFFF) >> 1),
            Region::Unmapped => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rom_first_high > self.rom_last_high {
            return Err(format!(
                "ROM window is empty ({:#06x}..={:#06x})",
                self.rom_first_high, self.rom_last_high
            ));
        }
        Ok(())
    }
}

/// The two address halves captured from the multiplexed AD lines.
///
/// A low half only completes an address if a high half was captured since
/// the last reset; a new high half discards whatever low half was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressLatch {
    high: u16,
    low: u16,
    high_seen: bool,
    valid: bool,
}

impl AddressLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn capture_high(&mut self, value: u16) {
        self.high = value;
        self.low = 0;
        self.high_seen = true;
        self.valid = false;
    }

    pub fn capture_low(&mut self, value: u16) {
        self.low = value;
        self.valid = self.high_seen;
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Both halves as captured, valid or not
    pub fn raw(&self) -> u32 {
        (self.high as u32) << 16 | self.low as u32
    }

    /// The full address, once both halves are latched
    pub fn current_address(&self) -> Option<u32> {
        self.valid.then(|| self.raw())
    }

    pub fn region(&self, map: &RegionMap) -> Region {
        map.decode(self.high)
    }

    /// Step to the next burst address. Carries into the high half.
    pub fn advance(&mut self, bytes: u16) {
        let next = self.raw().wrapping_add(bytes as u32);
        self.high = (next >> 16) as u16;
        self.low = next as u16;
    }
}
