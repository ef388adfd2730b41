//! Control/status register block behind the top of the cartridge window.
//!
//! Registers are 32 bits wide and appear on the 16-bit bus as two
//! big-endian halves: the even word is the high half.
//!
//! | Offset | Register      | Access |
//! |--------|---------------|--------|
//! | 0x00   | `ID`          | RO     |
//! | 0x04   | `CIC_STATUS`  | RO     |
//! | 0x08   | `CIC_CONTROL` | RW     |
//! | 0x0C   | `SCRATCH`     | RW     |

use kart_core::logging::{log, LogCategory, LogLevel};
use kart_core::port::{MemoryOp, MemoryPort, MemoryRequest, PortOutcome};

/// "KART"
pub const CONTROL_ID: u32 = 0x4B41_5254;

pub const REG_ID: usize = 0;
pub const REG_CIC_STATUS: usize = 1;
pub const REG_CIC_CONTROL: usize = 2;
pub const REG_SCRATCH: usize = 3;
const REG_COUNT: usize = 4;

/// `CIC_CONTROL` bit 0: hold the CIC in reset
pub const CIC_CONTROL_HOLD: u32 = 1 << 0;

pub struct ControlBlock {
    regs: [u32; REG_COUNT],
    reads: u64,
    writes: u64,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlock {
    pub fn new() -> Self {
        let mut regs = [0; REG_COUNT];
        regs[REG_ID] = CONTROL_ID;
        Self {
            regs,
            reads: 0,
            writes: 0,
        }
    }

    /// Clear the writable registers. The status mirror is refreshed by the
    /// system on the next tick.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn register(&self, index: usize) -> u32 {
        self.regs.get(index).copied().unwrap_or(0)
    }

    /// Mirror of the CIC lines and phase, written by the system
    pub fn set_cic_status(&mut self, status: u32) {
        self.regs[REG_CIC_STATUS] = status;
    }

    pub fn cic_hold(&self) -> bool {
        self.regs[REG_CIC_CONTROL] & CIC_CONTROL_HOLD != 0
    }

    pub fn access_counts(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }

    pub fn read_half(&self, word: u32) -> u16 {
        let index = (word >> 1) as usize;
        if index >= REG_COUNT {
            log(LogCategory::Stubs, LogLevel::Debug, || {
                format!("control: read of unknown offset {:#06x}", word << 1)
            });
            return 0;
        }
        let value = self.regs[index];
        if word & 1 == 0 {
            (value >> 16) as u16
        } else {
            value as u16
        }
    }

    pub fn write_half(&mut self, word: u32, data: u16) {
        let index = (word >> 1) as usize;
        match index {
            REG_CIC_CONTROL | REG_SCRATCH => {
                let value = &mut self.regs[index];
                *value = if word & 1 == 0 {
                    (*value & 0x0000_FFFF) | (data as u32) << 16
                } else {
                    (*value & 0xFFFF_0000) | data as u32
                };
                if index == REG_CIC_CONTROL {
                    let hold = *value & CIC_CONTROL_HOLD != 0;
                    log(LogCategory::Control, LogLevel::Info, || {
                        format!("control: CIC hold {}", if hold { "set" } else { "cleared" })
                    });
                }
            }
            REG_ID | REG_CIC_STATUS => {
                log(LogCategory::Control, LogLevel::Debug, || {
                    format!("control: write to read-only offset {:#06x} ignored", word << 1)
                });
            }
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("control: write to unknown offset {:#06x} ignored", word << 1)
                });
            }
        }
    }
}

impl MemoryPort for ControlBlock {
    fn submit(&mut self, request: MemoryRequest) -> PortOutcome {
        match request.op {
            MemoryOp::Read => {
                self.reads += 1;
                PortOutcome::Completed(Some(self.read_half(request.address)))
            }
            MemoryOp::Write => {
                self.writes += 1;
                self.write_half(request.address, request.data.unwrap_or(0));
                PortOutcome::Completed(None)
            }
        }
    }

    fn poll(&mut self) -> PortOutcome {
        PortOutcome::Completed(None)
    }
}
