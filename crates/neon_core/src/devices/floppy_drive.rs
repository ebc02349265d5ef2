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

    devices::floppy_drive.rs

    Implements a floppy drive backed by a flat sector image.

    The drive keeps exactly one raw track in memory: the track under the
    head on the side last selected by the controller. Modified tracks are
    written back to the image when the head leaves the track, when the
    controller is reset, or when the image is detached.

*/

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Error};

use crate::devices::fdc::track::{RawTrack, TRACK_IMAGE_BYTES, TRACK_WORDS};

pub const FLOPPY_MAX_CYLINDER: u8 = 80;
pub const FLOPPY_SIDES: usize = 2;
pub const FLOPPY_MAX_IMAGE_SIZE: u64 = FLOPPY_MAX_CYLINDER as u64 * FLOPPY_SIDES as u64 * TRACK_IMAGE_BYTES as u64;

#[derive(Default)]
pub struct FloppyDiskDrive {
    file: Option<File>,
    path: Option<PathBuf>,
    write_protected: bool,

    cylinder: u8,
    loaded: Option<(u8, u8)>,
    track: RawTrack,
    dirty: bool,
    datptr: usize,
    motor_on: bool,
}

/// Byte offset of the sectors of a track side in a flat image.
pub fn image_offset(cylinder: u8, side: u8) -> u64 {
    ((cylinder as u64 * 2) + side as u64) * TRACK_IMAGE_BYTES as u64
}

impl FloppyDiskDrive {
    pub fn new() -> Self {
        Default::default()
    }

    /// Open an image read-write, falling back to read-only. The drive is left detached on failure.
    pub fn attach_image(&mut self, path: &Path) -> Result<(), Error> {
        self.attach_image_with(path, |p| OpenOptions::new().read(true).write(true).open(p))
    }

    /// Open an image write protected, whether or not the host could write it.
    pub fn attach_image_read_only(&mut self, path: &Path) -> Result<(), Error> {
        self.detach_image();
        let file = File::open(path).map_err(|e| anyhow!("Couldn't open floppy image {}: {}", path.display(), e))?;
        self.install_image(file, path, true)
    }

    fn attach_image_with<F>(&mut self, path: &Path, open_read_write: F) -> Result<(), Error>
    where
        F: FnOnce(&Path) -> std::io::Result<File>,
    {
        self.detach_image();

        let (file, write_protected) = match open_read_write(path) {
            Ok(file) => (file, false),
            Err(e) => {
                log::debug!("Couldn't open {} read-write ({}), retrying read-only", path.display(), e);
                let file = File::open(path).map_err(|e| anyhow!("Couldn't open floppy image {}: {}", path.display(), e))?;
                (file, true)
            }
        };
        self.install_image(file, path, write_protected)
    }

    fn install_image(&mut self, file: File, path: &Path, write_protected: bool) -> Result<(), Error> {
        let len = file.metadata()?.len();
        if len == 0 || len % TRACK_IMAGE_BYTES as u64 != 0 || len > FLOPPY_MAX_IMAGE_SIZE {
            return Err(anyhow!(
                "Invalid floppy image size {} (must be a non-zero multiple of {} up to {})",
                len,
                TRACK_IMAGE_BYTES,
                FLOPPY_MAX_IMAGE_SIZE
            ));
        }

        log::debug!(
            "Attached floppy image {} ({} bytes{})",
            path.display(),
            len,
            if write_protected { ", read-only" } else { "" }
        );
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
        self.write_protected = write_protected;
        self.loaded = None;
        self.dirty = false;
        self.select_track(0);
        Ok(())
    }

    /// Flush any modified track and close the image.
    pub fn detach_image(&mut self) {
        if self.file.is_none() {
            return;
        }
        self.flush();
        if let Some(path) = self.path.take() {
            log::debug!("Detached floppy image {}", path.display());
        }
        self.file = None;
        self.loaded = None;
        self.track = RawTrack::unformatted();
        self.write_protected = false;
    }

    pub fn is_ready(&self) -> bool {
        self.file.is_some()
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cylinder(&self) -> u8 {
        self.cylinder
    }

    pub fn set_motor(&mut self, on: bool) {
        self.motor_on = on;
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    /// Move the head. The new track is loaded lazily on the next [FloppyDiskDrive::select_track].
    pub fn seek(&mut self, cylinder: u8) {
        self.cylinder = cylinder.min(FLOPPY_MAX_CYLINDER - 1);
    }

    /// Make the track under the head on the given side current, writing back the previous one if
    /// it was modified.
    pub fn select_track(&mut self, side: u8) {
        let wanted = (self.cylinder, side & 1);
        if self.loaded == Some(wanted) {
            return;
        }
        self.flush();
        self.track = match self.read_track_image(wanted.0, wanted.1) {
            Some(sectors) => RawTrack::encode(&sectors, wanted.0, wanted.1, 0),
            None => RawTrack::unformatted(),
        };
        self.loaded = Some(wanted);
    }

    fn read_track_image(&mut self, cylinder: u8, side: u8) -> Option<Vec<u8>> {
        let file = self.file.as_mut()?;
        let offset = image_offset(cylinder, side);
        let len = file.metadata().ok()?.len();
        if offset + TRACK_IMAGE_BYTES as u64 > len {
            return None;
        }

        let mut sectors = vec![0; TRACK_IMAGE_BYTES];
        let result = file.seek(SeekFrom::Start(offset)).and_then(|_| file.read_exact(&mut sectors));
        match result {
            Ok(()) => Some(sectors),
            Err(e) => {
                log::error!("Floppy: Error reading track {} side {}: {}", cylinder, side, e);
                None
            }
        }
    }

    /// Write the current track back to the image if it was modified. Sectors that can no longer be
    /// decoded from the track keep their previous image contents.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let Some((cylinder, side)) = self.loaded else {
            return;
        };
        if self.write_protected {
            log::warn!("Floppy: Discarding changes to write protected track {} side {}", cylinder, side);
            return;
        }

        let mut sectors = self
            .read_track_image(cylinder, side)
            .unwrap_or_else(|| vec![0; TRACK_IMAGE_BYTES]);
        let found = self.track.decode_into(&mut sectors);
        log::debug!("Floppy: Flushing track {} side {} ({} sectors)", cylinder, side, found);

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = file
            .seek(SeekFrom::Start(image_offset(cylinder, side)))
            .and_then(|_| file.write_all(&sectors))
            .and_then(|_| file.flush());
        if let Err(e) = result {
            log::error!("Floppy: Error writing track {} side {}: {}", cylinder, side, e);
        }
    }

    /// Advance the rotational position by one cell.
    pub fn rotate(&mut self) {
        self.datptr = (self.datptr + 1) % TRACK_WORDS;
    }

    /// The cell currently under the head.
    pub fn position(&self) -> usize {
        self.datptr
    }

    pub fn track(&self) -> &RawTrack {
        &self.track
    }

    /// Mutable access to the current track. Marks the track modified.
    pub fn track_mut(&mut self) -> &mut RawTrack {
        self.dirty = true;
        &mut self.track
    }

    /// Replace the current track with a freshly formatted one filled with `fill`.
    pub fn format_track(&mut self, side: u8, fill: u8) {
        self.select_track(side);
        self.track = RawTrack::encode(&[], self.cylinder, side & 1, fill);
        self.dirty = true;
    }
}

impl Drop for FloppyDiskDrive {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::devices::fdc::track::{DATA_ADDRESS_MARK, SECTOR_SIZE};

    fn image(tracks: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..tracks * TRACK_IMAGE_BYTES).map(|i| (i / SECTOR_SIZE) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    #[test]
    fn test_attach_rejects_bad_sizes() {
        let mut drive = FloppyDiskDrive::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        assert!(drive.attach_image(file.path()).is_err());

        file.write_all(&[0; 1000]).unwrap();
        assert!(drive.attach_image(file.path()).is_err());
        assert!(!drive.is_ready());

        assert!(drive.attach_image(Path::new("/nonexistent/neon.img")).is_err());
    }

    #[test]
    fn test_track_modification_flushed_on_track_switch() {
        let file = image(4);
        let mut drive = FloppyDiskDrive::new();
        drive.attach_image(file.path()).unwrap();
        assert!(drive.is_ready());

        drive.seek(1);
        drive.select_track(0);
        let marker = (0..TRACK_WORDS)
            .find(|&w| drive.track().mark_at(w) == Some(DATA_ADDRESS_MARK))
            .unwrap();
        drive.track_mut().set_word(marker + 2, 0x55AA);
        drive.track_mut().update_data_crc(marker);

        // Nothing reaches the file until the head leaves the track.
        let on_disk = std::fs::read(file.path()).unwrap();
        assert_eq!(on_disk[image_offset(1, 0) as usize], 20);

        drive.select_track(1);
        let on_disk = std::fs::read(file.path()).unwrap();
        let offset = image_offset(1, 0) as usize;
        assert_eq!(&on_disk[offset..offset + 2], &[0xAA, 0x55]);
        assert_eq!(on_disk[offset + 2], 20);
        assert_eq!(on_disk[offset + SECTOR_SIZE], 21);
    }

    #[test]
    fn test_read_write_open_failure_falls_back_to_read_only() {
        let file = image(4);
        let mut drive = FloppyDiskDrive::new();
        drive
            .attach_image_with(file.path(), |_| {
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            })
            .unwrap();
        assert!(drive.is_ready());
        assert!(drive.write_protected());

        // Changes to the cached track are dropped instead of being written back.
        drive.format_track(0, 0xE5);
        drive.seek(1);
        drive.select_track(0);
        let on_disk = std::fs::read(file.path()).unwrap();
        assert_eq!(on_disk[0], 0);
        assert_eq!(on_disk[SECTOR_SIZE], 1);

        drive.detach_image();
        assert!(!drive.write_protected());
        drive.attach_image(file.path()).unwrap();
        assert!(!drive.write_protected());
    }

    #[test]
    fn test_attach_read_only() {
        let file = image(2);
        let mut drive = FloppyDiskDrive::new();
        drive.attach_image_read_only(file.path()).unwrap();
        assert!(drive.is_ready());
        assert!(drive.write_protected());
        assert_eq!(drive.path(), Some(file.path()));
    }

    #[test]
    fn test_track_past_end_of_image_is_unformatted() {
        let file = image(2);
        let mut drive = FloppyDiskDrive::new();
        drive.attach_image(file.path()).unwrap();
        drive.seek(5);
        drive.select_track(0);
        assert!((0..TRACK_WORDS).all(|w| drive.track().id_at(w).is_none()));
    }
}
