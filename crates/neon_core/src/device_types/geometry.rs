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

    device_types::geometry.rs

    Define a [DriveGeometry] that represents the cylinder, head and sector
    layout presented by the hard disk controller.

*/

use std::fmt::Display;

use anyhow::{anyhow, Error};

pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// Preferred translation for images large enough to hold at least one cylinder of it.
const LARGE_HEADS: u8 = 16;
const LARGE_SECTORS: u8 = 63;
/// Fallback translation for small images.
const SMALL_HEADS: u8 = 4;
const SMALL_SECTORS: u8 = 16;

/// A structure representing how sectors are laid out on a hard disk image.
///  - Cylinder count (c)
///  - Head count (h)
///  - Sectors per track (s). Sector ids start at 1.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct DriveGeometry {
    pub(crate) c: u16,
    pub(crate) h: u8,
    pub(crate) s: u8,
}

impl Display for DriveGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{} h:{} s:{}]", self.c, self.h, self.s)
    }
}

impl DriveGeometry {
    pub fn new(c: u16, h: u8, s: u8) -> Self {
        Self { c, h, s }
    }

    /// Derive a geometry from the size of a flat image in bytes. Sectors past the last whole
    /// cylinder are not addressable.
    pub fn from_image_size(size: u64) -> Result<Self, Error> {
        if size == 0 || size % DEFAULT_SECTOR_SIZE as u64 != 0 {
            return Err(anyhow!(
                "Image size {} is not a non-zero multiple of {} bytes",
                size,
                DEFAULT_SECTOR_SIZE
            ));
        }
        let total = size / DEFAULT_SECTOR_SIZE as u64;

        let (h, s) = if total >= LARGE_HEADS as u64 * LARGE_SECTORS as u64 {
            (LARGE_HEADS, LARGE_SECTORS)
        }
        else {
            (SMALL_HEADS, SMALL_SECTORS)
        };
        let c = (total / (h as u64 * s as u64)).min(u16::MAX as u64) as u16;
        if c == 0 {
            return Err(anyhow!("Image of {} sectors is smaller than one cylinder", total));
        }
        Ok(Self { c, h, s })
    }

    /// Return the cylinder count (c) field.
    #[inline]
    pub fn c(&self) -> u16 {
        self.c
    }
    /// Return the head count (h) field.
    #[inline]
    pub fn h(&self) -> u8 {
        self.h
    }
    /// Return the sectors per track (s) field.
    #[inline]
    pub fn s(&self) -> u8 {
        self.s
    }

    /// Return the number of sectors represented by a [DriveGeometry].
    pub fn total_sectors(&self) -> u32 {
        (self.c as u32) * (self.h as u32) * (self.s as u32)
    }

    /// Convert a cylinder, head and sector id to a linear block address, if the address lies
    /// inside the geometry.
    pub fn chs_to_lba(&self, c: u16, h: u8, s: u8) -> Option<u32> {
        if c >= self.c || h >= self.h || s == 0 || s > self.s {
            return None;
        }
        Some((c as u32 * self.h as u32 + h as u32) * self.s as u32 + (s as u32 - 1))
    }

    /// Convert a linear block address back to cylinder, head and sector id.
    pub fn lba_to_chs(&self, lba: u32) -> (u16, u8, u8) {
        let spc = self.h as u32 * self.s as u32;
        let c = (lba / spc) as u16;
        let h = ((lba % spc) / self.s as u32) as u8;
        let s = (lba % self.s as u32) as u8 + 1;
        (c, h, s)
    }
}
