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

    devices::ata::ata_string.rs

    [AtaString] formats the fixed-width ASCII fields of the drive
    identification block.

*/

use binrw::binrw;

/// A space padded ASCII field of `N` bytes, stored with the two bytes of every 16-bit word swapped.
#[binrw]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AtaString<const N: usize> {
    #[br(count = N)]
    #[bw(assert(raw.len() == N, "raw length must be N"))]
    raw: Vec<u8>,
}

impl<const N: usize> From<&str> for AtaString<N> {
    fn from(s: &str) -> Self {
        let mut raw = vec![b' '; N];
        let bytes = s.as_bytes();
        let len = bytes.len().min(N);
        raw[..len].copy_from_slice(&bytes[..len]);
        for chunk in raw.chunks_mut(2) {
            chunk.swap(0, 1);
        }
        Self { raw }
    }
}

impl<const N: usize> AtaString<N> {
    /// Undo the byte swapping and strip the padding.
    pub fn decode(raw: &[u8]) -> String {
        let mut unswapped = raw.to_vec();
        for chunk in unswapped.chunks_mut(2) {
            chunk.swap(0, 1);
        }
        String::from_utf8_lossy(&unswapped).trim_end().to_string()
    }

    pub fn as_string(&self) -> String {
        Self::decode(&self.raw)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_swapped_padding() {
        let s = AtaString::<8>::from("NEON1");
        assert_eq!(s.raw(), b"ENNO 1  ");
        assert_eq!(s.as_string(), "NEON1");

        let long = AtaString::<4>::from("TRUNCATED");
        assert_eq!(long.as_string(), "TRUN");
    }
}
