/*
    NeonPC
    Bus and peripheral emulation core

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    devices::ata::ata_identification.rs

    The 512 byte block returned by the IDENTIFY DRIVE command.

*/

use std::io::Cursor;

use binrw::{binrw, BinWrite};

use crate::{
    device_types::geometry::{DriveGeometry, DEFAULT_SECTOR_SIZE},
    devices::ata::ata_string::AtaString,
};

pub const CAPABILITIES_LBA: u16 = 0b0000_0010_0000_0000;
pub const GENERAL_FIXED_DISK: u16 = 0b0000_0000_0100_0000;

pub const IDENTIFY_SERIAL: &str = "NEONPC0000000001";
pub const IDENTIFY_FIRMWARE: &str = "1.0";
pub const IDENTIFY_MODEL: &str = "NeonPC Hard Drive";

/// Word offsets of fields within the block.
pub const WORD_CYLINDERS: usize = 1;
pub const WORD_HEADS: usize = 3;
pub const WORD_SECTORS: usize = 6;
pub const WORD_SERIAL: usize = 10;
pub const WORD_FIRMWARE: usize = 23;
pub const WORD_MODEL: usize = 27;
pub const WORD_CAPABILITIES: usize = 49;
pub const WORD_TOTAL_SECTORS: usize = 60;

#[binrw]
#[derive(Default)]
#[brw(little)]
pub struct AtaDriveIdentification {
    pub general: u16,
    pub cylinders: u16,
    pub specific_configuration: u16,
    pub num_heads: u16,
    pub unformatted_bytes_per_track: u16,
    pub unformatted_bytes_per_sector: u16,
    pub sectors_per_track: u16,
    pub vendor_unique: [u16; 3],
    pub serial_no: AtaString<20>,
    pub buffer_type: u16,
    pub buffer_size: u16,
    pub long_cmd_bytes: u16,
    pub firmware_revision: AtaString<8>,
    pub model_number: AtaString<40>,
    pub maximum_block_transfer: u8,
    pub vendor_unique2: u8,
    pub double_word_io: u16,
    pub capabilities: u16,
    pub reserved: u16,
    pub pio_timing: u16,
    pub dma_timing: u16,
    pub field_validity: u16,
    pub current_cylinders: u16,
    pub current_heads: u16,
    pub current_sectors_per_track: u16,
    pub current_capacity_low: u16,
    pub current_capacity_high: u16,
    pub multiple_sector: u16,
    pub user_addressable_sectors: u32,
}

impl AtaDriveIdentification {
    pub fn new(geometry: &DriveGeometry) -> Self {
        let capacity = geometry.total_sectors();
        let sector_size = DEFAULT_SECTOR_SIZE as u16;

        AtaDriveIdentification {
            general: GENERAL_FIXED_DISK,
            cylinders: geometry.c(),
            num_heads: geometry.h() as u16,
            unformatted_bytes_per_track: sector_size.wrapping_mul(geometry.s() as u16),
            unformatted_bytes_per_sector: sector_size,
            sectors_per_track: geometry.s() as u16,
            serial_no: AtaString::from(IDENTIFY_SERIAL),
            firmware_revision: AtaString::from(IDENTIFY_FIRMWARE),
            model_number: AtaString::from(IDENTIFY_MODEL),
            maximum_block_transfer: 1,
            capabilities: CAPABILITIES_LBA,
            field_validity: 1,
            current_cylinders: geometry.c(),
            current_heads: geometry.h() as u16,
            current_sectors_per_track: geometry.s() as u16,
            current_capacity_low: capacity as u16,
            current_capacity_high: (capacity >> 16) as u16,
            user_addressable_sectors: capacity,
            ..Default::default()
        }
    }

    /// Serialize into a zero padded sector sized block.
    pub fn to_sector(&self) -> Result<Vec<u8>, binrw::Error> {
        let mut cursor = Cursor::new(vec![0u8; DEFAULT_SECTOR_SIZE]);
        self.write(&mut cursor)?;
        let mut block = cursor.into_inner();
        block.resize(DEFAULT_SECTOR_SIZE, 0);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(block: &[u8], n: usize) -> u16 {
        u16::from_le_bytes([block[n * 2], block[n * 2 + 1]])
    }

    #[test]
    fn test_identification_layout() {
        let geometry = DriveGeometry::new(300, 16, 63);
        let block = AtaDriveIdentification::new(&geometry).to_sector().unwrap();
        assert_eq!(block.len(), DEFAULT_SECTOR_SIZE);
        assert_eq!(word(&block, WORD_CYLINDERS), 300);
        assert_eq!(word(&block, WORD_HEADS), 16);
        assert_eq!(word(&block, WORD_SECTORS), 63);
        assert_eq!(word(&block, WORD_CAPABILITIES), CAPABILITIES_LBA);

        let total = word(&block, WORD_TOTAL_SECTORS) as u32 | (word(&block, WORD_TOTAL_SECTORS + 1) as u32) << 16;
        assert_eq!(total, 300 * 16 * 63);

        let model = &block[WORD_MODEL * 2..WORD_MODEL * 2 + 40];
        assert_eq!(AtaString::<40>::decode(model), IDENTIFY_MODEL);
        let serial = &block[WORD_SERIAL * 2..WORD_SERIAL * 2 + 20];
        assert_eq!(AtaString::<20>::decode(serial), IDENTIFY_SERIAL);
        let firmware = &block[WORD_FIRMWARE * 2..WORD_FIRMWARE * 2 + 8];
        assert_eq!(AtaString::<8>::decode(firmware), IDENTIFY_FIRMWARE);
    }
}
