//! CRC-32 (IEEE 802.3, reflected)
//!
//! Polynomial 0xEDB88320, initial value all ones, final complement. On the
//! wire the checksum follows the payload in little-endian byte order.

const POLY: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Incremental CRC-32 calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Start a new checksum
    pub const fn new() -> Self {
        Self { state: !0 }
    }

    /// Feed one byte
    #[inline]
    pub fn add(&mut self, byte: u8) {
        self.state = TABLE[((self.state ^ u32::from(byte)) & 0xFF) as usize] ^ (self.state >> 8);
    }

    /// Feed a block of bytes
    pub fn add_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.add(byte);
        }
    }

    /// Checksum of everything fed so far
    pub const fn get(&self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32 of a block
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.add_bytes(data);
    crc.get()
}
