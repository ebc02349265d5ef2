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

    bus::memory.rs

    Address translation and RAM/ROM access.

    The 16-bit virtual space is split into eight 8KB segments. Each
    processor mode has its own table of segment descriptors (HR for HALT
    mode, UR for USER mode). The top 8KB of the space holds the I/O
    window and a fixed system page that does not go through the tables.

*/

use anyhow::{anyhow, Error};

use crate::bus::{BusInterface, ROM_SIZE, SEGMENT_COUNT};

/// HALT mode sees ROM below this address.
pub const ROM_WINDOW_END: u16 = 0o40000;
/// Start of the fixed top page.
pub const IO_WINDOW_START: u16 = 0o160000;
/// The I/O window runs up to, but not including, this address.
pub const IO_WINDOW_END: u16 = 0o170000;
/// USER mode accesses in this range trap to firmware.
pub const EMULATED_IO_START: u16 = 0o174000;
pub const EMULATED_IO_END: u16 = 0o177700;

const SYSTEM_PAGE_MASK: u16 = 0o7777;
const SEGMENT_SHIFT: u16 = 13;
const SEGMENT_OFFSET_MASK: u16 = 0x1FFF;
const DESCRIPTOR_DENY_BIT: u16 = 0x0001;
const DESCRIPTOR_BASE_MASK: u16 = 0xFFE0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Ram,
    Rom,
    Io,
    EmulatedIo,
    Deny,
}

/// Classify a virtual address. `descriptors` is the segment table of the active mode.
///
/// The returned offset is only meaningful for [MemoryKind::Ram] and [MemoryKind::Rom]; for RAM
/// it is always less than `ram_size`.
pub fn translate(
    address: u16,
    halt: bool,
    _fetch: bool,
    descriptors: &[u16; SEGMENT_COUNT],
    ram_size: usize,
) -> (MemoryKind, usize) {
    if halt && address < ROM_WINDOW_END {
        return (MemoryKind::Rom, address as usize);
    }

    if address >= IO_WINDOW_START {
        if address < IO_WINDOW_END {
            return (MemoryKind::Io, address as usize);
        }
        if !halt && (EMULATED_IO_START..EMULATED_IO_END).contains(&address) {
            return (MemoryKind::EmulatedIo, address as usize);
        }
        return (MemoryKind::Ram, (address & SYSTEM_PAGE_MASK) as usize);
    }

    let descriptor = descriptors[(address >> SEGMENT_SHIFT) as usize];
    if descriptor & DESCRIPTOR_DENY_BIT != 0 {
        return (MemoryKind::Deny, 0);
    }

    let offset = (address & SEGMENT_OFFSET_MASK) as usize + (((descriptor & DESCRIPTOR_BASE_MASK) as usize) << 8);
    if offset >= ram_size {
        (MemoryKind::Deny, 0)
    }
    else {
        (MemoryKind::Ram, offset)
    }
}

impl BusInterface {
    /// Translate an address using the segment table of the given mode.
    #[inline]
    pub fn translate(&self, address: u16, halt: bool, fetch: bool) -> (MemoryKind, usize) {
        let table = if halt { &self.hr } else { &self.ur };
        translate(address, halt, fetch, table, self.ram.len())
    }

    #[inline]
    pub(crate) fn ram_word(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.ram[offset], self.ram[offset + 1]])
    }

    #[inline]
    pub(crate) fn set_ram_word(&mut self, offset: usize, data: u16) {
        self.ram[offset..offset + 2].copy_from_slice(&data.to_le_bytes());
    }

    #[inline]
    pub(crate) fn rom_word(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.rom[offset], self.rom[offset + 1]])
    }

    pub(crate) fn check_watch(&mut self, address: u16) {
        if self.watches.contains(address) || self.watches.contains(address & !1) {
            log::debug!("Watched address {:06o} written", address);
            self.watch_hit = Some(address);
        }
    }

    /// Read a word as a debugger would, without side effects. Returns None for denied, emulated
    /// or unpeekable addresses.
    pub fn peek_word(&self, address: u16, halt: bool) -> Option<u16> {
        let address = address & !1;
        match self.translate(address, halt, false) {
            (MemoryKind::Ram, offset) => Some(self.ram_word(offset)),
            (MemoryKind::Rom, offset) => Some(self.rom_word(offset)),
            (MemoryKind::Io, _) => self.peek_port(address),
            _ => None,
        }
    }

    /// Load a ROM image. Images shorter than the ROM window are padded with zeros.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), Error> {
        if image.is_empty() || image.len() > ROM_SIZE {
            return Err(anyhow!(
                "ROM image size {} out of range (1-{} bytes)",
                image.len(),
                ROM_SIZE
            ));
        }
        self.rom.fill(0);
        self.rom[..image.len()].copy_from_slice(image);
        log::debug!("Loaded {} byte ROM image", image.len());
        Ok(())
    }

    /// Copy data into physical RAM at the specified offset.
    pub fn copy_from(&mut self, src: &[u8], location: usize) -> Result<(), Error> {
        if location + src.len() > self.ram.len() {
            log::error!("copy out of range: {} len: {}", location, src.len());
            return Err(anyhow!("copy of {} bytes to {} exceeds RAM size", src.len(), location));
        }
        self.ram[location..location + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Return a read-only view of physical RAM.
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub(crate) fn restore_memory(&mut self, ram: &[u8], rom: &[u8]) -> Result<(), Error> {
        if ram.len() != self.ram.len() {
            return Err(anyhow!(
                "snapshot RAM size {} does not match configured size {}",
                ram.len(),
                self.ram.len()
            ));
        }
        if rom.len() != ROM_SIZE {
            return Err(anyhow!("snapshot ROM size {} is not {}", rom.len(), ROM_SIZE));
        }
        self.ram.copy_from_slice(ram);
        self.rom.copy_from_slice(rom);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM_512K: usize = 512 * 1024;

    #[test]
    fn test_halt_mode_rom_window() {
        let table = [0u16; SEGMENT_COUNT];
        assert_eq!(translate(0o37776, true, true, &table, RAM_512K), (MemoryKind::Rom, 0o37776));
        // USER mode never sees the ROM.
        assert_eq!(translate(0o37776, false, true, &table, RAM_512K).0, MemoryKind::Ram);
    }

    #[test]
    fn test_io_window_and_system_page() {
        let table = [0u16; SEGMENT_COUNT];
        assert_eq!(translate(0o161000, false, false, &table, RAM_512K).0, MemoryKind::Io);
        assert_eq!(translate(0o161000, true, false, &table, RAM_512K).0, MemoryKind::Io);
        assert_eq!(
            translate(0o174000, false, false, &table, RAM_512K).0,
            MemoryKind::EmulatedIo
        );
        assert_eq!(
            translate(0o174000, true, false, &table, RAM_512K),
            (MemoryKind::Ram, 0o4000)
        );
        assert_eq!(
            translate(0o177700, false, false, &table, RAM_512K),
            (MemoryKind::Ram, 0o7700)
        );
    }

    #[test]
    fn test_descriptor_deny_and_bounds() {
        let mut table = [0u16; SEGMENT_COUNT];
        table[1] = 0x0001;
        assert_eq!(translate(0o20000, false, false, &table, RAM_512K).0, MemoryKind::Deny);

        // Segment base 0x7E0 << 8 = 0x7E000, plus 0x1FFF stays below 512K.
        table[2] = 0x07E0;
        assert_eq!(
            translate(0o57776, false, false, &table, RAM_512K),
            (MemoryKind::Ram, 0x7E000 + 0x1FFE)
        );

        // A base past the end of RAM denies the access.
        table[2] = 0x0800;
        assert_eq!(translate(0o40000, false, false, &table, RAM_512K).0, MemoryKind::Deny);
    }

    #[test]
    fn test_translate_is_deterministic() {
        let table = [0x0000, 0x0020, 0x0100, 0x07E0, 0x0801, 0x1FE0, 0xFFE0, 0x0041];
        for ram_size in [RAM_512K, 1024 * 1024, 4096 * 1024] {
            for address in (0..=0xFFFFu32).step_by(7) {
                let address = address as u16;
                for halt in [false, true] {
                    let first = translate(address, halt, false, &table, ram_size);
                    let second = translate(address, halt, false, &table, ram_size);
                    assert_eq!(first, second);
                    if first.0 == MemoryKind::Ram {
                        assert!(first.1 < ram_size);
                    }
                }
            }
        }
    }
}
