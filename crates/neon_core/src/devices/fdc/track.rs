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

    devices::fdc::track.rs

    Raw track representation used by the floppy controller.

    A track is stored as a ring of 16-bit cells, two encoded bytes per cell
    (the first byte in the low half). A parallel bitmap flags the cells that
    hold an A1 A1 synchronization mark, which cannot appear in ordinary data.

*/

pub const TRACK_BYTES: usize = 6250;
pub const TRACK_WORDS: usize = TRACK_BYTES / 2;
pub const SECTORS_PER_TRACK: usize = 10;
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_WORDS: usize = SECTOR_SIZE / 2;
/// Bytes of sector data per side of a track in a flat image.
pub const TRACK_IMAGE_BYTES: usize = SECTORS_PER_TRACK * SECTOR_SIZE;
/// Sector size code N for 512 byte sectors.
pub const SECTOR_SIZE_CODE: u8 = 2;

pub const ID_ADDRESS_MARK: u8 = 0xFE;
pub const DATA_ADDRESS_MARK: u8 = 0xFB;
pub const DELETED_DATA_ADDRESS_MARK: u8 = 0xF8;

const GAP_BYTE: u8 = 0x4E;
const SYNC_BYTE: u8 = 0x00;
const MARK_BYTE: u8 = 0xA1;

const GAP4A_LEN: usize = 32;
const SYNC_LEN: usize = 12;
const GAP2_LEN: usize = 22;
const GAP3_LEN: usize = 24;

/// A sector ID field as found on the track.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectorId {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    pub crc_ok: bool,
}

/// CRC-CCITT (polynomial 0x1021, initial value 0xFFFF) as used by the address marks.
pub fn crc_ccitt(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0xFFFF, |crc, &b| {
        let mut crc = crc ^ ((b as u16) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
        crc
    })
}

struct TrackBuilder {
    bytes: Vec<u8>,
    marks: Vec<usize>,
}

impl TrackBuilder {
    fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(TRACK_BYTES),
            marks: Vec::new(),
        }
    }

    fn fill(&mut self, byte: u8, len: usize) {
        self.bytes.extend(std::iter::repeat(byte).take(len));
    }

    /// Emit an address mark followed by its payload and CRC.
    fn field(&mut self, mark: u8, payload: &[u8]) {
        self.fill(SYNC_BYTE, SYNC_LEN);
        let start = self.bytes.len();
        self.marks.push(start / 2);
        self.bytes.extend_from_slice(&[MARK_BYTE, MARK_BYTE, MARK_BYTE, mark]);
        self.bytes.extend_from_slice(payload);
        let crc = crc_ccitt(&self.bytes[start..]);
        self.bytes.extend_from_slice(&crc.to_be_bytes());
    }

    fn finish(mut self) -> RawTrack {
        let remaining = TRACK_BYTES.saturating_sub(self.bytes.len());
        self.fill(GAP_BYTE, remaining);
        self.bytes.truncate(TRACK_BYTES);

        let data: Vec<u16> = self
            .bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let mut markers = vec![false; TRACK_WORDS];
        for m in self.marks {
            markers[m] = true;
        }
        RawTrack { data, markers }
    }
}

#[derive(Clone)]
pub struct RawTrack {
    data: Vec<u16>,
    markers: Vec<bool>,
}

impl Default for RawTrack {
    fn default() -> Self {
        Self::unformatted()
    }
}

impl RawTrack {
    /// A track with no address marks at all.
    pub fn unformatted() -> Self {
        Self {
            data: vec![u16::from_le_bytes([GAP_BYTE, GAP_BYTE]); TRACK_WORDS],
            markers: vec![false; TRACK_WORDS],
        }
    }

    /// Build a formatted track holding sectors 1..=10 from a flat sector image. Missing bytes in
    /// `sectors` are encoded as `fill`.
    pub fn encode(sectors: &[u8], c: u8, h: u8, fill: u8) -> Self {
        let mut builder = TrackBuilder::new();
        builder.fill(GAP_BYTE, GAP4A_LEN);

        let mut data = [fill; SECTOR_SIZE];
        for s in 0..SECTORS_PER_TRACK {
            let offset = s * SECTOR_SIZE;
            data.fill(fill);
            if offset < sectors.len() {
                let end = (offset + SECTOR_SIZE).min(sectors.len());
                data[..end - offset].copy_from_slice(&sectors[offset..end]);
            }

            builder.field(ID_ADDRESS_MARK, &[c, h, (s + 1) as u8, SECTOR_SIZE_CODE]);
            builder.fill(GAP_BYTE, GAP2_LEN);
            builder.field(DATA_ADDRESS_MARK, &data);
            builder.fill(GAP_BYTE, GAP3_LEN);
        }
        builder.finish()
    }

    #[inline]
    pub fn word(&self, index: usize) -> u16 {
        self.data[index % TRACK_WORDS]
    }

    #[inline]
    pub fn set_word(&mut self, index: usize, word: u16) {
        self.data[index % TRACK_WORDS] = word;
    }

    #[inline]
    pub fn is_marker(&self, index: usize) -> bool {
        self.markers[index % TRACK_WORDS]
    }

    fn byte(&self, byte_index: usize) -> u8 {
        let word = self.word(byte_index / 2);
        if byte_index & 1 == 0 {
            word as u8
        }
        else {
            (word >> 8) as u8
        }
    }

    /// Return the address mark byte following the synchronization cell at `marker`.
    pub fn mark_at(&self, marker: usize) -> Option<u8> {
        if !self.is_marker(marker) {
            return None;
        }
        let word = self.word(marker + 1);
        (word as u8 == MARK_BYTE).then_some((word >> 8) as u8)
    }

    /// Decode the ID field whose synchronization cell is at `marker`.
    pub fn id_at(&self, marker: usize) -> Option<SectorId> {
        if self.mark_at(marker)? != ID_ADDRESS_MARK {
            return None;
        }
        let start = marker * 2;
        let field: Vec<u8> = (start..start + 8).map(|i| self.byte(i)).collect();
        let stored = u16::from_be_bytes([self.byte(start + 8), self.byte(start + 9)]);
        Some(SectorId {
            c: field[4],
            h: field[5],
            r: field[6],
            n: field[7],
            crc_ok: crc_ccitt(&field) == stored,
        })
    }

    fn data_crc(&self, marker: usize) -> u16 {
        let start = marker * 2;
        let field: Vec<u8> = (start..start + 4 + SECTOR_SIZE).map(|i| self.byte(i)).collect();
        crc_ccitt(&field)
    }

    /// Check the CRC of the data field whose synchronization cell is at `marker`.
    pub fn data_crc_ok(&self, marker: usize) -> bool {
        let stored = self.word(marker + 2 + SECTOR_WORDS).to_le_bytes();
        self.data_crc(marker) == u16::from_be_bytes(stored)
    }

    /// Recompute the CRC of the data field whose synchronization cell is at `marker`.
    pub fn update_data_crc(&mut self, marker: usize) {
        let crc = self.data_crc(marker);
        self.set_word(marker + 2 + SECTOR_WORDS, u16::from_le_bytes(crc.to_be_bytes()));
    }

    /// Scan the track for sectors 1..=10 and copy their data into `out`. Returns the number of
    /// sectors found.
    pub fn decode_into(&self, out: &mut [u8]) -> usize {
        let mut found = 0;
        let mut pending: Option<SectorId> = None;

        for w in 0..TRACK_WORDS {
            match self.mark_at(w) {
                Some(ID_ADDRESS_MARK) => pending = self.id_at(w),
                Some(DATA_ADDRESS_MARK | DELETED_DATA_ADDRESS_MARK) => {
                    let Some(id) = pending.take() else {
                        continue;
                    };
                    if id.n != SECTOR_SIZE_CODE || id.r == 0 || id.r as usize > SECTORS_PER_TRACK {
                        continue;
                    }
                    let offset = (id.r as usize - 1) * SECTOR_SIZE;
                    if offset + SECTOR_SIZE > out.len() {
                        continue;
                    }
                    for i in 0..SECTOR_WORDS {
                        let bytes = self.word(w + 2 + i).to_le_bytes();
                        out[offset + i * 2..offset + i * 2 + 2].copy_from_slice(&bytes);
                    }
                    found += 1;
                }
                _ => {}
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Vec<u8> {
        (0..TRACK_IMAGE_BYTES).map(|i| (i * 7 + i / 512) as u8).collect()
    }

    #[test]
    fn test_crc_ccitt() {
        // Standard check value for "123456789".
        assert_eq!(crc_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_track_layout() {
        let track = RawTrack::encode(&pattern(), 3, 1, 0xE5);
        let ids: Vec<SectorId> = (0..TRACK_WORDS).filter_map(|w| track.id_at(w)).collect();
        assert_eq!(ids.len(), SECTORS_PER_TRACK);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!((id.c, id.h, id.r, id.n), (3, 1, i as u8 + 1, SECTOR_SIZE_CODE));
            assert!(id.crc_ok);
        }
        // Ordinary data never looks like a synchronization cell.
        let marks = (0..TRACK_WORDS).filter(|&w| track.is_marker(w)).count();
        assert_eq!(marks, SECTORS_PER_TRACK * 2);
    }

    #[test]
    fn test_decode_recovers_sector_data() {
        let image = pattern();
        let mut track = RawTrack::encode(&image, 0, 0, 0);
        let mut out = vec![0u8; TRACK_IMAGE_BYTES];
        assert_eq!(track.decode_into(&mut out), SECTORS_PER_TRACK);
        assert_eq!(out, image);

        // Overwrite the first data word of sector 1 and check the change survives decoding.
        let data_mark = (0..TRACK_WORDS)
            .find(|&w| track.mark_at(w) == Some(DATA_ADDRESS_MARK))
            .unwrap();
        assert!(track.data_crc_ok(data_mark));
        track.set_word(data_mark + 2, 0xBEEF);
        assert!(!track.data_crc_ok(data_mark));
        track.update_data_crc(data_mark);
        assert!(track.data_crc_ok(data_mark));
        track.decode_into(&mut out);
        assert_eq!(&out[0..2], &[0xEF, 0xBE]);
    }

    #[test]
    fn test_unformatted_track_has_no_sectors() {
        let track = RawTrack::unformatted();
        let mut out = vec![0u8; TRACK_IMAGE_BYTES];
        assert_eq!(track.decode_into(&mut out), 0);
        assert!((0..TRACK_WORDS).all(|w| track.id_at(w).is_none()));
    }
}
