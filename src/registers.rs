//! Card registers read back over SPI

/// Operation conditions register, as returned after CMD58
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdOcr {
    pub ocr: u32,
}

impl SdOcr {
    /// Assemble the register from the four bytes following the status byte
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            ocr: u32::from_be_bytes(bytes),
        }
    }
    /// Returns true if the card is still powering up
    pub fn is_busy(&self) -> bool {
        (self.ocr & (1 << 31)) == 0
    }
    /// Returns true if the CCS bit is set, meaning the card is block addressed
    pub fn ccs(&self) -> bool {
        (self.ocr & (1 << 30)) > 0
    }
}

/// Card specific data register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdCsd {
    csd: [u8; 16],
}

impl SdCsd {
    pub fn new(csd: [u8; 16]) -> Self {
        Self { csd }
    }

    /// Structure version, 0 for standard capacity and 1 for high capacity
    pub fn version(&self) -> u8 {
        self.csd[0] >> 6
    }

    /// Card capacity in 512 byte blocks, None for unknown layouts
    pub fn block_count(&self) -> Option<u32> {
        match self.version() {
            0 => {
                let c_size = (((self.csd[6] & 0x03) as u32) << 10)
                    | ((self.csd[7] as u32) << 2)
                    | ((self.csd[8] >> 6) as u32);
                let c_size_mult = (((self.csd[9] & 0x03) << 1) | (self.csd[10] >> 7)) as u32;
                let read_bl_len = (self.csd[5] & 0x0F) as u32;

                // capacity = (C_SIZE + 1) * 2^(C_SIZE_MULT + 2) * 2^READ_BL_LEN
                let shift = c_size_mult + 2 + read_bl_len;
                let bytes = ((c_size + 1) as u64) << shift;

                Some((bytes / 512) as u32)
            }
            1 => {
                let c_size = (((self.csd[7] & 0x3F) as u32) << 16)
                    | ((self.csd[8] as u32) << 8)
                    | (self.csd[9] as u32);

                // capacity = (C_SIZE + 1) * 512KiB, 2TiB cards don't fit
                (c_size + 1).checked_mul(1024)
            }
            _ => None,
        }
    }
}
