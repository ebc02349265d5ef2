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

    devices::ata::ata_device.rs

    Implements the IDE register interface of the board's hard disk
    controller. A single master drive is backed by a flat image of 512 byte
    sectors.

    Sector transfers complete asynchronously: a command arms a countdown in
    frame ticks and the sector moves between the image and the sector
    buffer when the countdown expires.

*/

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Error};
use modular_bitfield::bitfield;

use crate::{
    bus::IoDevice,
    device_types::geometry::{DriveGeometry, DEFAULT_SECTOR_SIZE},
    devices::ata::ata_identification::AtaDriveIdentification,
};

pub const IDE_BASE_PORT: u16 = 0o161740;
pub const IDE_REGISTER_COUNT: u16 = 8;
pub const IDE_ALT_STATUS_PORT: u16 = 0o161760;

pub const IDE_REG_DATA: u16 = 0;
pub const IDE_REG_ERROR: u16 = 1;
pub const IDE_REG_SECTOR_COUNT: u16 = 2;
pub const IDE_REG_SECTOR_NUMBER: u16 = 3;
pub const IDE_REG_CYLINDER_LOW: u16 = 4;
pub const IDE_REG_CYLINDER_HIGH: u16 = 5;
pub const IDE_REG_DRIVE_HEAD: u16 = 6;
pub const IDE_REG_STATUS: u16 = 7;

/// Frame ticks needed to move one sector between the image and the buffer.
pub const SECTOR_TICKS: u32 = 64;
const READ_TIMEOUT: u32 = SECTOR_TICKS * 3;
const WRITE_TIMEOUT: u32 = SECTOR_TICKS;

const DRIVE_HEAD_LBA_BIT: u8 = 0b0100_0000;
const DRIVE_HEAD_SLAVE_BIT: u8 = 0b0001_0000;
const DRIVE_HEAD_BITS_ON: u8 = 0b1010_0000;
const DEVICE_CONTROL_NIEN: u8 = 0b0000_0010;
const DEVICE_CONTROL_SRST: u8 = 0b0000_0100;
/// Error register value after a reset: diagnostics passed.
const DIAGNOSTIC_PASSED: u8 = 0x01;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtaCommand {
    None,
    ReadSectors,
    WriteSectors,
    IdentifyDrive,
}

/// The asynchronous event that completes when the timeout expires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingEvent {
    None,
    ReadSector,
    WriteSector,
}

/// Guest visible failure conditions, mapped onto the error register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdeError {
    Aborted,
    IdNotFound,
    BadSector,
}

#[bitfield]
#[derive(Copy, Clone, Debug)]
pub struct AtaStatusRegister {
    pub err: bool,   // Error
    pub idx: bool,   // Index
    pub corr: bool,  // Corrected Data
    pub drq: bool,   // Data Request
    pub dsc: bool,   // Disk Seek Complete
    pub dwf: bool,   // Drive Write Failure
    pub ready: bool, // Drive Ready
    pub busy: bool,  // Drive Busy
}

#[bitfield]
#[derive(Copy, Clone, Debug)]
pub struct AtaErrorRegister {
    pub amnf: bool, // Address Mark Not Found
    pub tk0: bool,  // Track 0 Not Found
    pub abrt: bool, // Command Aborted
    pub mcr: bool,  // Media Change Request
    pub idnf: bool, // ID Not Found
    pub mc: bool,   // Media changed
    pub unc: bool,  // Unrecoverable
    pub bbk: bool,  // Bad Block
}

struct AtaDisk {
    file: File,
    path: PathBuf,
    read_only: bool,
    geometry: DriveGeometry,
}

pub struct AtaController {
    disk: Option<AtaDisk>,

    status_register: AtaStatusRegister,
    error_register: AtaErrorRegister,
    features_register: u8,
    sector_count_register: u8,
    sector_number_register: u8,
    cylinder_low_register: u8,
    cylinder_high_register: u8,
    drive_head_register: u8,
    device_control_register: u8,

    command: AtaCommand,
    command_lba: u32,
    sectors_left: u32,
    multiple_count: u8,

    sector_buffer: Vec<u8>,
    sector_buffer_idx: usize,

    pending: PendingEvent,
    timeout: u32,

    send_interrupt: bool,
}

impl Default for AtaController {
    fn default() -> Self {
        Self {
            disk: None,
            status_register: AtaStatusRegister::from_bytes([0]),
            error_register: AtaErrorRegister::from_bytes([DIAGNOSTIC_PASSED]),
            features_register: 0,
            sector_count_register: 1,
            sector_number_register: 1,
            cylinder_low_register: 0,
            cylinder_high_register: 0,
            drive_head_register: DRIVE_HEAD_BITS_ON,
            device_control_register: 0,
            command: AtaCommand::None,
            command_lba: 0,
            sectors_left: 0,
            multiple_count: 1,
            sector_buffer: vec![0; DEFAULT_SECTOR_SIZE],
            sector_buffer_idx: DEFAULT_SECTOR_SIZE,
            pending: PendingEvent::None,
            timeout: 0,
            send_interrupt: false,
        }
    }
}

impl IoDevice for AtaController {
    fn read_u16(&mut self, port: u16) -> u16 {
        if port == IDE_ALT_STATUS_PORT {
            return self.status_register_read() as u16;
        }
        match (port - IDE_BASE_PORT) >> 1 {
            IDE_REG_DATA => self.data_register_read(),
            reg => self.register_read(reg) as u16,
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        if port == IDE_ALT_STATUS_PORT {
            self.device_control_write(data as u8);
            return;
        }
        match (port - IDE_BASE_PORT) >> 1 {
            IDE_REG_DATA => self.data_register_write(data),
            reg => self.register_write(reg, data as u8),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        if port == IDE_ALT_STATUS_PORT {
            return Some(self.status_register_read() as u16);
        }
        match (port - IDE_BASE_PORT) >> 1 {
            IDE_REG_DATA => None,
            reg => Some(self.register_read(reg) as u16),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        let names = [
            "Data",
            "Error/Features",
            "Sector Count",
            "Sector Number",
            "Cylinder Low",
            "Cylinder High",
            "Drive/Head",
            "Status/Command",
        ];
        let mut ports: Vec<(String, u16)> = names
            .iter()
            .enumerate()
            .map(|(n, name)| (format!("IDE {}", name), IDE_BASE_PORT + n as u16 * 2))
            .collect();
        ports.push((String::from("IDE Alternate Status/Device Control"), IDE_ALT_STATUS_PORT));
        ports
    }
}

impl AtaController {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reset the device registers. The attached image stays attached.
    pub fn reset(&mut self) {
        log::debug!("IDE: Device reset");
        self.status_register = AtaStatusRegister::from_bytes([0]);
        self.error_register = AtaErrorRegister::from_bytes([DIAGNOSTIC_PASSED]);
        self.features_register = 0;
        self.sector_count_register = 1;
        self.sector_number_register = 1;
        self.cylinder_low_register = 0;
        self.cylinder_high_register = 0;
        self.drive_head_register = DRIVE_HEAD_BITS_ON;
        self.command = AtaCommand::None;
        self.sectors_left = 0;
        self.multiple_count = 1;
        self.sector_buffer_idx = DEFAULT_SECTOR_SIZE;
        self.pending = PendingEvent::None;
        self.timeout = 0;
        self.send_interrupt = false;
        self.set_idle_status();
    }

    fn set_idle_status(&mut self) {
        let present = self.disk.is_some();
        self.status_register.set_busy(false);
        self.status_register.set_drq(false);
        self.status_register.set_ready(present);
        self.status_register.set_dsc(present);
    }

    /// Attach a hard disk image, opening it read-write if possible.
    pub fn attach_image(&mut self, path: &Path) -> Result<(), Error> {
        self.attach_image_with(path, |p| OpenOptions::new().read(true).write(true).open(p))
    }

    /// Attach a hard disk image read-only. Write commands are aborted.
    pub fn attach_image_read_only(&mut self, path: &Path) -> Result<(), Error> {
        self.detach_image();
        let file = File::open(path).map_err(|e| anyhow!("Couldn't open hard disk image {}: {}", path.display(), e))?;
        self.install_image(file, path, true)
    }

    fn attach_image_with<F>(&mut self, path: &Path, open_read_write: F) -> Result<(), Error>
    where
        F: FnOnce(&Path) -> std::io::Result<File>,
    {
        self.detach_image();

        let (file, read_only) = match open_read_write(path) {
            Ok(file) => (file, false),
            Err(e) => {
                log::debug!("Couldn't open {} read-write ({}), retrying read-only", path.display(), e);
                let file = File::open(path).map_err(|e| anyhow!("Couldn't open hard disk image {}: {}", path.display(), e))?;
                (file, true)
            }
        };
        self.install_image(file, path, read_only)
    }

    fn install_image(&mut self, file: File, path: &Path, read_only: bool) -> Result<(), Error> {
        let geometry = DriveGeometry::from_image_size(file.metadata()?.len())?;
        log::debug!(
            "IDE: Attached {} with geometry {}{}",
            path.display(),
            geometry,
            if read_only { " (read-only)" } else { "" }
        );

        self.disk = Some(AtaDisk {
            file,
            path: path.to_path_buf(),
            read_only,
            geometry,
        });
        self.reset();
        Ok(())
    }

    pub fn detach_image(&mut self) {
        if let Some(disk) = self.disk.take() {
            log::debug!("IDE: Detached {}", disk.path.display());
            self.reset();
        }
    }

    pub fn read_only(&self) -> bool {
        self.disk.as_ref().is_some_and(|d| d.read_only)
    }

    pub fn geometry(&self) -> Option<DriveGeometry> {
        self.disk.as_ref().map(|d| d.geometry)
    }

    /// The block size accepted by the last SET MULTIPLE MODE command.
    pub fn multiple_count(&self) -> u8 {
        self.multiple_count
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }

    fn raise_interrupt(&mut self) {
        if self.device_control_register & DEVICE_CONTROL_NIEN == 0 {
            self.send_interrupt = true;
        }
    }

    fn slave_selected(&self) -> bool {
        self.drive_head_register & DRIVE_HEAD_SLAVE_BIT != 0
    }

    pub fn status_register_read(&self) -> u8 {
        if self.slave_selected() {
            return 0;
        }
        self.status_register.into_bytes()[0]
    }

    pub fn error_register_read(&self) -> u8 {
        self.error_register.into_bytes()[0]
    }

    pub fn register_read(&self, reg: u16) -> u8 {
        match reg {
            IDE_REG_ERROR => self.error_register_read(),
            IDE_REG_SECTOR_COUNT => self.sector_count_register,
            IDE_REG_SECTOR_NUMBER => self.sector_number_register,
            IDE_REG_CYLINDER_LOW => self.cylinder_low_register,
            IDE_REG_CYLINDER_HIGH => self.cylinder_high_register,
            IDE_REG_DRIVE_HEAD => self.drive_head_register,
            IDE_REG_STATUS => self.status_register_read(),
            _ => 0,
        }
    }

    pub fn register_write(&mut self, reg: u16, byte: u8) {
        log::trace!("IDE: Register {} write: {:02X}", reg, byte);
        match reg {
            IDE_REG_ERROR => self.features_register = byte,
            IDE_REG_SECTOR_COUNT => self.sector_count_register = byte,
            IDE_REG_SECTOR_NUMBER => self.sector_number_register = byte,
            IDE_REG_CYLINDER_LOW => self.cylinder_low_register = byte,
            IDE_REG_CYLINDER_HIGH => self.cylinder_high_register = byte,
            IDE_REG_DRIVE_HEAD => self.drive_head_register = byte | DRIVE_HEAD_BITS_ON,
            IDE_REG_STATUS => self.handle_command_register_write(byte),
            _ => {}
        }
    }

    fn device_control_write(&mut self, byte: u8) {
        let was_reset = self.device_control_register & DEVICE_CONTROL_SRST != 0;
        self.device_control_register = byte;
        if byte & DEVICE_CONTROL_SRST != 0 && !was_reset {
            self.reset();
        }
    }

    /// Build the block address from the task file registers.
    fn construct_lba_address(&self) -> Option<u32> {
        let geometry = self.disk.as_ref()?.geometry;
        if self.drive_head_register & DRIVE_HEAD_LBA_BIT != 0 {
            let lba = self.sector_number_register as u32
                | (self.cylinder_low_register as u32) << 8
                | (self.cylinder_high_register as u32) << 16
                | ((self.drive_head_register & 0x0F) as u32) << 24;
            (lba < geometry.total_sectors()).then_some(lba)
        }
        else {
            let cylinder = u16::from_le_bytes([self.cylinder_low_register, self.cylinder_high_register]);
            geometry.chs_to_lba(cylinder, self.drive_head_register & 0x0F, self.sector_number_register)
        }
    }

    /// Write the block address back to the task file registers, in the addressing mode the host
    /// selected.
    fn distribute_lba_address(&mut self, lba: u32) {
        if self.drive_head_register & DRIVE_HEAD_LBA_BIT != 0 {
            self.sector_number_register = lba as u8;
            self.cylinder_low_register = (lba >> 8) as u8;
            self.cylinder_high_register = (lba >> 16) as u8;
            self.drive_head_register = (self.drive_head_register & 0xF0) | ((lba >> 24) as u8 & 0x0F);
        }
        else if let Some(geometry) = self.geometry() {
            let (c, h, s) = geometry.lba_to_chs(lba);
            self.sector_number_register = s;
            [self.cylinder_low_register, self.cylinder_high_register] = c.to_le_bytes();
            self.drive_head_register = (self.drive_head_register & 0xF0) | (h & 0x0F);
        }
    }

    fn set_error(&mut self, error: IdeError) {
        log::debug!("IDE: Command {:?} failed: {:?}", self.command, error);
        self.error_register = AtaErrorRegister::from_bytes([0]);
        match error {
            IdeError::Aborted => self.error_register.set_abrt(true),
            IdeError::IdNotFound => self.error_register.set_idnf(true),
            IdeError::BadSector => self.error_register.set_bbk(true),
        }
        self.status_register.set_err(true);
        self.status_register.set_busy(false);
        self.status_register.set_drq(false);
        self.command = AtaCommand::None;
        self.pending = PendingEvent::None;
        self.sectors_left = 0;
        self.raise_interrupt();
    }

    fn sector_count(&self) -> u32 {
        match self.sector_count_register {
            0 => 256,
            n => n as u32,
        }
    }

    pub fn handle_command_register_write(&mut self, byte: u8) {
        if self.slave_selected() {
            log::debug!("IDE: Command {:02X} for absent slave device ignored", byte);
            return;
        }
        log::debug!("IDE: Command {:02X} features: {:02X}", byte, self.features_register);

        // A new command clears any stalled error state.
        self.error_register = AtaErrorRegister::from_bytes([0]);
        self.status_register.set_err(false);
        self.pending = PendingEvent::None;
        self.command = AtaCommand::None;

        let Some(disk) = &self.disk else {
            self.set_error(IdeError::Aborted);
            return;
        };
        let read_only = disk.read_only;

        match byte {
            0x20 | 0x21 | 0xC4 => self.command_read_sectors(),
            0x30 | 0x31 | 0xC5 => {
                if read_only {
                    log::warn!("IDE: Write command to read-only image");
                    self.set_error(IdeError::Aborted);
                }
                else {
                    self.command_write_sectors();
                }
            }
            0xEC => self.command_identify_drive(),
            0x10..=0x1F => {
                self.cylinder_low_register = 0;
                self.cylinder_high_register = 0;
                self.command_complete();
            }
            0x70..=0x7F => match self.construct_lba_address() {
                Some(_) => self.command_complete(),
                None => self.set_error(IdeError::IdNotFound),
            },
            0x91 => {
                // The geometry is fixed by the image size; the requested translation is accepted.
                log::debug!(
                    "IDE: Initialize drive parameters: heads {} sectors {}",
                    (self.drive_head_register & 0x0F) + 1,
                    self.sector_count_register
                );
                self.command_complete();
            }
            0xC6 => {
                self.multiple_count = self.sector_count_register;
                self.command_complete();
            }
            _ => {
                log::warn!("IDE: Unsupported command {:02X}", byte);
                self.set_error(IdeError::Aborted);
            }
        }
    }

    fn command_complete(&mut self) {
        self.set_idle_status();
        self.raise_interrupt();
    }

    fn command_read_sectors(&mut self) {
        let Some(lba) = self.construct_lba_address() else {
            self.set_error(IdeError::IdNotFound);
            return;
        };
        self.command = AtaCommand::ReadSectors;
        self.command_lba = lba;
        self.sectors_left = self.sector_count();
        self.arm(PendingEvent::ReadSector, READ_TIMEOUT);
    }

    fn command_write_sectors(&mut self) {
        let Some(lba) = self.construct_lba_address() else {
            self.set_error(IdeError::IdNotFound);
            return;
        };
        self.command = AtaCommand::WriteSectors;
        self.command_lba = lba;
        self.sectors_left = self.sector_count();
        self.sector_buffer_idx = 0;
        self.status_register.set_busy(false);
        self.status_register.set_drq(true);
    }

    fn command_identify_drive(&mut self) {
        let Some(geometry) = self.geometry() else {
            self.set_error(IdeError::Aborted);
            return;
        };
        match AtaDriveIdentification::new(&geometry).to_sector() {
            Ok(block) => {
                // The board's data bus is inverted relative to the drive's.
                self.sector_buffer = block.iter().map(|b| !b).collect();
                self.sector_buffer_idx = 0;
                self.command = AtaCommand::IdentifyDrive;
                self.set_idle_status();
                self.status_register.set_drq(true);
                self.raise_interrupt();
            }
            Err(e) => {
                log::error!("IDE: Error writing drive identification block: {}", e);
                self.set_error(IdeError::Aborted);
            }
        }
    }

    fn arm(&mut self, event: PendingEvent, ticks: u32) {
        self.status_register.set_busy(true);
        self.status_register.set_drq(false);
        self.pending = event;
        self.timeout = ticks;
    }

    pub fn data_register_read(&mut self) -> u16 {
        if !self.status_register.drq() || self.sector_buffer_idx >= DEFAULT_SECTOR_SIZE {
            log::trace!("IDE: Data register read with no data");
            return 0;
        }
        let i = self.sector_buffer_idx;
        let word = u16::from_le_bytes([self.sector_buffer[i], self.sector_buffer[i + 1]]);
        self.sector_buffer_idx += 2;

        if self.sector_buffer_idx >= DEFAULT_SECTOR_SIZE {
            self.status_register.set_drq(false);
            match self.command {
                AtaCommand::ReadSectors if self.sectors_left > 0 => {
                    self.arm(PendingEvent::ReadSector, READ_TIMEOUT);
                }
                _ => self.command = AtaCommand::None,
            }
        }
        word
    }

    pub fn data_register_write(&mut self, data: u16) {
        if self.command != AtaCommand::WriteSectors || !self.status_register.drq() {
            log::trace!("IDE: Unexpected data register write: {:04X}", data);
            return;
        }
        let i = self.sector_buffer_idx;
        self.sector_buffer[i..i + 2].copy_from_slice(&data.to_le_bytes());
        self.sector_buffer_idx += 2;
        if self.sector_buffer_idx >= DEFAULT_SECTOR_SIZE {
            self.arm(PendingEvent::WriteSector, WRITE_TIMEOUT);
        }
    }

    /// Advance the pending timeout by one frame tick.
    pub fn tick(&mut self) {
        if self.pending == PendingEvent::None {
            return;
        }
        self.timeout = self.timeout.saturating_sub(1);
        if self.timeout > 0 {
            return;
        }

        let event = std::mem::replace(&mut self.pending, PendingEvent::None);
        match event {
            PendingEvent::ReadSector => self.operation_read_sector(),
            PendingEvent::WriteSector => self.operation_write_sector(),
            PendingEvent::None => {}
        }
    }

    fn sector_io<F>(&mut self, op: F) -> Result<(), std::io::Error>
    where
        F: FnOnce(&mut File, &mut Vec<u8>) -> Result<(), std::io::Error>,
    {
        let lba = self.command_lba;
        let Some(disk) = self.disk.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no image attached"));
        };
        disk.file.seek(SeekFrom::Start(lba as u64 * DEFAULT_SECTOR_SIZE as u64))?;
        op(&mut disk.file, &mut self.sector_buffer)
    }

    fn operation_read_sector(&mut self) {
        self.sector_buffer.resize(DEFAULT_SECTOR_SIZE, 0);
        if let Err(e) = self.sector_io(|file, buf| file.read_exact(buf)) {
            log::error!("IDE: Error reading sector {}: {}", self.command_lba, e);
            self.set_error(IdeError::BadSector);
            return;
        }
        log::trace!("IDE: Read sector {}", self.command_lba);

        self.sector_buffer_idx = 0;
        self.sectors_left -= 1;
        if self.sectors_left > 0 {
            self.command_lba += 1;
            self.distribute_lba_address(self.command_lba);
        }
        self.sector_count_register = self.sectors_left as u8;
        self.status_register.set_busy(false);
        self.status_register.set_drq(true);
        self.raise_interrupt();
    }

    fn operation_write_sector(&mut self) {
        if let Err(e) = self.sector_io(|file, buf| file.write_all(buf).and_then(|_| file.flush())) {
            log::error!("IDE: Error writing sector {}: {}", self.command_lba, e);
            self.set_error(IdeError::BadSector);
            return;
        }
        log::trace!("IDE: Wrote sector {}", self.command_lba);

        self.sectors_left -= 1;
        self.sector_count_register = self.sectors_left as u8;
        self.status_register.set_busy(false);
        if self.sectors_left > 0 {
            self.command_lba += 1;
            self.distribute_lba_address(self.command_lba);
            self.sector_buffer_idx = 0;
            self.status_register.set_drq(true);
        }
        else {
            self.command = AtaCommand::None;
        }
        self.raise_interrupt();
    }
}
