//! ROM image loading

use crate::CartError;

/// N64 ROM magic number (big-endian format)
pub const N64_ROM_MAGIC: [u8; 4] = [0x80, 0x37, 0x12, 0x40];

/// Header word written over every image unless configured otherwise
pub const DEFAULT_HEADER: u32 = 0x8037_1240;

pub const MIN_ROM_SIZE: usize = 0x1000;

/// Top of SDRAM kept free for the cartridge firmware
pub const FIRMWARE_RESERVED: usize = 16 * 1024;

/// Byte order of an image file, detected from its first word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Native big-endian (.z64)
    BigEndian,
    /// 32-bit little-endian (.n64)
    LittleEndian,
    /// 16-bit byte-swapped (.v64)
    ByteSwapped,
}

/// A normalised (big-endian) ROM image ready for upload
pub struct RomImage {
    data: Vec<u8>,
    byte_order: ByteOrder,
}

impl RomImage {
    /// Parse an image file. `capacity` is the backing-store size in bytes.
    pub fn load(data: &[u8], capacity: usize) -> Result<Self, CartError> {
        if data.len() < MIN_ROM_SIZE {
            return Err(CartError::InvalidRom(
                "ROM too small (minimum 4KB)".to_string(),
            ));
        }
        let max = capacity.saturating_sub(FIRMWARE_RESERVED);
        if data.len() > max {
            return Err(CartError::RomTooLarge {
                size: data.len(),
                max,
            });
        }

        let byte_order = Self::detect_byte_order(data)?;
        let mut rom = data.to_vec();
        match byte_order {
            ByteOrder::BigEndian => {}
            ByteOrder::LittleEndian => {
                for chunk in rom.chunks_exact_mut(4) {
                    chunk.reverse();
                }
            }
            ByteOrder::ByteSwapped => {
                for chunk in rom.chunks_exact_mut(2) {
                    chunk.swap(0, 1);
                }
            }
        }

        Ok(Self {
            data: rom,
            byte_order,
        })
    }

    fn detect_byte_order(data: &[u8]) -> Result<ByteOrder, CartError> {
        match &data[0..4] {
            [0x80, 0x37, 0x12, 0x40] => Ok(ByteOrder::BigEndian),
            [0x40, 0x12, 0x37, 0x80] => Ok(ByteOrder::LittleEndian),
            [0x37, 0x80, 0x40, 0x12] => Ok(ByteOrder::ByteSwapped),
            _ => Err(CartError::InvalidRom(
                "Unrecognized N64 ROM format (bad magic)".to_string(),
            )),
        }
    }

    /// Synthetic image: valid header, then each word holds its own index.
    pub fn test_pattern(size: usize) -> Self {
        let size = size.max(MIN_ROM_SIZE) & !3;
        let mut data: Vec<u8> = (0..size / 2)
            .flat_map(|i| (i as u16).to_be_bytes())
            .collect();
        data[0..4].copy_from_slice(&N64_ROM_MAGIC);
        data[0x20..0x34].copy_from_slice(b"KART64 TEST PATTERN ");
        Self {
            data,
            byte_order: ByteOrder::BigEndian,
        }
    }

    /// Replace the first header word (clock rate and PI timing bits).
    pub fn with_header(mut self, header: u32) -> Self {
        self.data[0..4].copy_from_slice(&header.to_be_bytes());
        self
    }

    pub fn header(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn title(&self) -> String {
        String::from_utf8_lossy(&self.data[0x20..0x34])
            .trim_end_matches(['\0', ' '])
            .to_string()
    }

    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The image as 16-bit bus words
    pub fn words(&self) -> Vec<u16> {
        self.data
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
            .collect()
    }
}
