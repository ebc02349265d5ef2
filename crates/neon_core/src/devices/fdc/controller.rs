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

    devices::fdc::controller.rs

    Implements a uPD765-style floppy disk controller in non-DMA mode.

    The controller accepts command bytes through the data FIFO, executes
    simple commands immediately and runs data transfers against the
    rotating raw track of the addressed drive. The periodic hook advances
    every attached disk by one cell; the host moves one 16-bit word through
    the data port per cell while a transfer is in progress.

*/

use std::{collections::VecDeque, path::Path};

use anyhow::{anyhow, Error};
use modular_bitfield::{bitfield, prelude::*};

use crate::{
    bus::IoDevice,
    devices::{
        fdc::track::{DATA_ADDRESS_MARK, DELETED_DATA_ADDRESS_MARK, SECTOR_WORDS, TRACK_WORDS},
        floppy_drive::FloppyDiskDrive,
    },
};

pub const FDC_MAX_DRIVES: usize = 4;

pub const FDC_DATA_PORT: u16 = 0o161060;
pub const FDC_STATUS_PORT: u16 = 0o161062;
pub const FDC_CONTROL_PORT: u16 = 0o161064;

// Main Status Register Bit Definitions
// --------------------------------------------------------------------------------
// The low four bits flag drives in positioning mode. Seeks complete instantly here,
// so they always read zero.
pub const FDC_STATUS_FDC_BUSY: u8 = 0b0001_0000;
pub const FDC_STATUS_NON_DMA_MODE: u8 = 0b0010_0000;
pub const FDC_STATUS_DIO: u8 = 0b0100_0000;
pub const FDC_STATUS_MRQ: u8 = 0b1000_0000;

pub const COMMAND_MASK: u8 = 0b0001_1111;

pub const COMMAND_READ_TRACK: u8 = 0x02;
pub const COMMAND_SPECIFY: u8 = 0x03;
pub const COMMAND_SENSE_DRIVE_STATUS: u8 = 0x04;
pub const COMMAND_WRITE_DATA: u8 = 0x05;
pub const COMMAND_READ_DATA: u8 = 0x06;
pub const COMMAND_RECALIBRATE: u8 = 0x07;
pub const COMMAND_SENSE_INT_STATUS: u8 = 0x08;
pub const COMMAND_READ_SECTOR_ID: u8 = 0x0A;
pub const COMMAND_FORMAT_TRACK: u8 = 0x0D;
pub const COMMAND_SEEK_HEAD: u8 = 0x0F;

pub const ST0_HEAD_ACTIVE: u8 = 0b0000_0100;
pub const ST0_NOT_READY: u8 = 0b0000_1000;
pub const ST0_UNIT_CHECK: u8 = 0b0001_0000;
pub const ST0_SEEK_END: u8 = 0b0010_0000;

pub const ST1_NO_ID: u8 = 0b0000_0001;
pub const ST1_WRITE_PROTECT: u8 = 0b0000_0010;
pub const ST1_NODATA: u8 = 0b0000_0100;
pub const ST1_OVERRUN: u8 = 0b0001_0000;
pub const ST1_CRC: u8 = 0b0010_0000;

pub const ST2_NO_DAM: u8 = 0b0000_0001;
pub const ST2_WRONG_CYLINDER: u8 = 0b0001_0000;
pub const ST2_DATA_CRC: u8 = 0b0010_0000;
pub const ST2_CONTROL_MARK: u8 = 0b0100_0000;

pub const ST3_HEAD: u8 = 0b0000_0100;
pub const ST3_DOUBLESIDED: u8 = 0b0000_1000;
pub const ST3_TRACK0: u8 = 0b0001_0000;
pub const ST3_READY: u8 = 0b0010_0000;
pub const ST3_WRITE_PROTECT: u8 = 0b0100_0000;

/// Single byte result returned for an invalid command, or a sense interrupt with nothing pending.
pub const RESULT_INVALID: u8 = 0x80;

/// Index pulses allowed to pass during an ID search before giving up.
const SEARCH_REVOLUTIONS: u8 = 2;

#[derive(Copy, Clone, Debug)]
pub enum InterruptCode {
    NormalTermination,
    AbnormalTermination,
    InvalidCommand,
    AbnormalPolling,
}

impl InterruptCode {
    fn st0_bits(&self) -> u8 {
        match self {
            InterruptCode::NormalTermination => 0b0000_0000,
            InterruptCode::AbnormalTermination => 0b0100_0000,
            InterruptCode::InvalidCommand => 0b1000_0000,
            InterruptCode::AbnormalPolling => 0b1100_0000,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ControllerPhase {
    #[default]
    Command,
    Executing,
    Result,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ReadTrack,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterruptStatus,
    ReadSectorId,
    FormatTrack,
    SeekHead,
}

type CommandDispatchFn = fn(&mut FloppyController) -> Continuation;

pub enum Continuation {
    CommandComplete,
    ContinueAsOperation,
}

impl Command {
    /// Look up a command by its opcode, returning the total command length including the opcode
    /// byte and the handler. Returns None for unrecognized opcodes.
    fn decode(opcode: u8) -> Option<(Command, usize, CommandDispatchFn)> {
        let entry: (Command, usize, CommandDispatchFn) = match opcode & COMMAND_MASK {
            COMMAND_READ_TRACK => (Command::ReadTrack, 9, FloppyController::command_read_track),
            COMMAND_SPECIFY => (Command::Specify, 3, FloppyController::command_specify),
            COMMAND_SENSE_DRIVE_STATUS => (
                Command::SenseDriveStatus,
                2,
                FloppyController::command_sense_drive_status,
            ),
            COMMAND_WRITE_DATA => (Command::WriteData, 9, FloppyController::command_write_data),
            COMMAND_READ_DATA => (Command::ReadData, 9, FloppyController::command_read_data),
            COMMAND_RECALIBRATE => (Command::Recalibrate, 2, FloppyController::command_recalibrate),
            COMMAND_SENSE_INT_STATUS => (
                Command::SenseInterruptStatus,
                1,
                FloppyController::command_sense_interrupt,
            ),
            COMMAND_READ_SECTOR_ID => (Command::ReadSectorId, 2, FloppyController::command_read_sector_id),
            COMMAND_FORMAT_TRACK => (Command::FormatTrack, 6, FloppyController::command_format_track),
            COMMAND_SEEK_HEAD => (Command::SeekHead, 3, FloppyController::command_seek_head),
            _ => return None,
        };
        Some(entry)
    }
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct CommandByte {
    pub command: B5,
    pub skip: bool,
    pub mfm: bool,
    pub mt: bool,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct DriveHeadSelect {
    pub drive: B2,
    pub head: B1,
    #[skip]
    unused: B5,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct DriveControl {
    pub drive_select: B2,
    pub reset_n: bool,
    #[skip]
    unused: B1,
    pub motors: B4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    ReadData,
    WriteData,
    ReadTrack,
    NotReady,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationPhase {
    SearchId,
    SearchData,
    Transfer,
}

/// A data transfer command in progress.
#[derive(Copy, Clone, Debug)]
struct Operation {
    kind: OperationKind,
    phase: OperationPhase,
    drive: usize,
    head: u8,
    mt: bool,
    c: u8,
    h: u8,
    r: u8,
    n: u8,
    eot: u8,
    index_pulses: u8,
    ids_seen: bool,
    wrong_cylinder: bool,
    marker: usize,
    skip: u8,
    words: usize,
    sectors: usize,
}

pub struct FloppyController {
    drives: [FloppyDiskDrive; FDC_MAX_DRIVES],
    phase: ControllerPhase,
    control: DriveControl,
    in_reset: bool,

    command: Option<Command>,
    command_fn: Option<CommandDispatchFn>,
    command_len: usize,
    command_bytes: Vec<u8>,
    results: VecDeque<u8>,

    operation: Option<Operation>,
    data_word: u16,
    more_data: bool,
    st0_flags: u8,
    st1: u8,
    st2: u8,

    // ST0 and present cylinder of a finished seek, per drive, until sensed.
    pending_seek: [Option<(u8, u8)>; FDC_MAX_DRIVES],
    reset_sense_count: u8,
    send_interrupt: bool,
}

impl Default for FloppyController {
    fn default() -> Self {
        Self {
            drives: Default::default(),
            phase: ControllerPhase::Command,
            control: DriveControl::from_bytes([0b0000_0100]),
            in_reset: false,
            command: None,
            command_fn: None,
            command_len: 0,
            command_bytes: Vec::with_capacity(9),
            results: VecDeque::with_capacity(7),
            operation: None,
            data_word: 0,
            more_data: false,
            st0_flags: 0,
            st1: 0,
            st2: 0,
            pending_seek: [None; FDC_MAX_DRIVES],
            reset_sense_count: 0,
            send_interrupt: false,
        }
    }
}

impl IoDevice for FloppyController {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            FDC_DATA_PORT => self.handle_data_register_read(),
            FDC_STATUS_PORT => self.handle_status_register_read() as u16,
            FDC_CONTROL_PORT => self.control.into_bytes()[0] as u16,
            _ => unreachable!("FLOPPY: Bad port #"),
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            FDC_DATA_PORT => self.handle_data_register_write(data),
            FDC_STATUS_PORT => log::warn!("FLOPPY: Write to read-only status register: {:06o}", data),
            FDC_CONTROL_PORT => self.handle_control_register_write(data as u8),
            _ => unreachable!("FLOPPY: Bad port #"),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            FDC_STATUS_PORT => Some(self.handle_status_register_read() as u16),
            FDC_CONTROL_PORT => Some(self.control.into_bytes()[0] as u16),
            _ => None,
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("FDC Data Register"), FDC_DATA_PORT),
            (String::from("FDC Main Status Register"), FDC_STATUS_PORT),
            (String::from("FDC Drive Control Register"), FDC_CONTROL_PORT),
        ]
    }
}

impl FloppyController {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reset the controller as the machine reset line does. Attached images stay attached.
    pub fn reset(&mut self) {
        self.reset_controller();
        self.control = DriveControl::from_bytes([0b0000_0100]);
        self.in_reset = false;
        self.reset_sense_count = 0;
        self.send_interrupt = false;
        for drive in self.drives.iter_mut() {
            drive.seek(0);
            drive.set_motor(false);
        }
    }

    /// Internal controller reset. Modified tracks are written back.
    fn reset_controller(&mut self) {
        log::debug!("FLOPPY: Controller reset");
        self.phase = ControllerPhase::Command;
        self.command = None;
        self.command_fn = None;
        self.command_len = 0;
        self.command_bytes.clear();
        self.results.clear();
        self.operation = None;
        self.more_data = false;
        self.pending_seek = [None; FDC_MAX_DRIVES];
        for drive in self.drives.iter_mut() {
            drive.flush();
        }
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    /// The command being received or executed, if any.
    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn drive(&self, n: usize) -> Option<&FloppyDiskDrive> {
        self.drives.get(n)
    }

    pub fn attach_image(&mut self, drive: usize, path: &Path) -> Result<(), Error> {
        self.drives
            .get_mut(drive)
            .ok_or_else(|| anyhow!("Invalid floppy drive number: {}", drive))?
            .attach_image(path)
    }

    pub fn attach_image_read_only(&mut self, drive: usize, path: &Path) -> Result<(), Error> {
        self.drives
            .get_mut(drive)
            .ok_or_else(|| anyhow!("Invalid floppy drive number: {}", drive))?
            .attach_image_read_only(path)
    }

    pub fn detach_image(&mut self, drive: usize) {
        if let Some(drive) = self.drives.get_mut(drive) {
            drive.detach_image();
        }
    }

    pub fn handle_status_register_read(&self) -> u8 {
        let mut msr = 0;
        match self.phase {
            ControllerPhase::Command => {
                msr |= FDC_STATUS_MRQ;
                if !self.results.is_empty() {
                    msr |= FDC_STATUS_DIO;
                }
                if !self.command_bytes.is_empty() {
                    msr |= FDC_STATUS_FDC_BUSY;
                }
            }
            ControllerPhase::Executing => {
                msr |= FDC_STATUS_NON_DMA_MODE | FDC_STATUS_FDC_BUSY;
                if let Some(op) = &self.operation {
                    if op.phase == OperationPhase::Transfer && self.more_data {
                        msr |= FDC_STATUS_MRQ;
                        if op.kind != OperationKind::WriteData {
                            msr |= FDC_STATUS_DIO;
                        }
                    }
                }
            }
            ControllerPhase::Result => {
                msr |= FDC_STATUS_MRQ | FDC_STATUS_DIO | FDC_STATUS_FDC_BUSY;
            }
        }
        msr
    }

    pub fn handle_data_register_read(&mut self) -> u16 {
        if self.phase == ControllerPhase::Executing {
            return match &self.operation {
                Some(op) if op.kind != OperationKind::WriteData && self.more_data => {
                    self.more_data = false;
                    self.data_word
                }
                _ => {
                    log::warn!("FLOPPY: Data register read with no data available");
                    0
                }
            };
        }

        let Some(byte) = self.results.pop_front() else {
            log::warn!("FLOPPY: Data register read with empty result buffer");
            return 0;
        };
        if self.results.is_empty() && self.phase == ControllerPhase::Result {
            log::trace!("FLOPPY: Result phase complete");
            self.phase = ControllerPhase::Command;
        }
        byte as u16
    }

    pub fn handle_data_register_write(&mut self, data: u16) {
        match self.phase {
            ControllerPhase::Executing => {
                match &self.operation {
                    Some(op) if op.kind == OperationKind::WriteData => {
                        self.data_word = data;
                        self.more_data = false;
                    }
                    _ => log::warn!("FLOPPY: Data register write during execution: {:06o}", data),
                }
            }
            ControllerPhase::Result => {
                log::warn!("FLOPPY: Data register write during result phase: {:06o}", data);
            }
            ControllerPhase::Command => self.command_byte_write(data as u8),
        }
    }

    fn command_byte_write(&mut self, byte: u8) {
        if self.command_bytes.is_empty() {
            // A new command discards an unread result.
            self.results.clear();
            match Command::decode(byte) {
                Some((command, len, command_fn)) => {
                    log::debug!("FLOPPY: Received command {:?} ({:02X})", command, byte);
                    self.command = Some(command);
                    self.command_fn = Some(command_fn);
                    self.command_len = len;
                }
                None => {
                    log::warn!("FLOPPY: Received invalid command byte: {:02X}", byte);
                    self.results.push_back(RESULT_INVALID);
                    return;
                }
            }
        }

        self.command_bytes.push(byte);
        if self.command_bytes.len() < self.command_len {
            return;
        }

        // We read last byte expected for this command, so dispatch to the appropriate command handler
        self.phase = ControllerPhase::Executing;
        let result = match self.command_fn.take() {
            Some(command_fn) => command_fn(self),
            None => Continuation::CommandComplete,
        };

        if let Continuation::CommandComplete = result {
            self.command = None;
            if self.phase == ControllerPhase::Executing {
                self.phase = ControllerPhase::Command;
            }
        }
        self.command_bytes.clear();
        self.command_len = 0;
    }

    fn handle_control_register_write(&mut self, byte: u8) {
        let control = DriveControl::from_bytes([byte]);
        log::trace!("FLOPPY: Drive control register write: {:08b}", byte);
        for (i, drive) in self.drives.iter_mut().enumerate() {
            drive.set_motor(control.motors() & (1 << i) != 0);
        }

        if !control.reset_n() {
            if !self.in_reset {
                self.reset_controller();
                self.in_reset = true;
            }
        }
        else if self.in_reset {
            // Leaving reset reports a ready change on every drive.
            self.in_reset = false;
            self.reset_sense_count = FDC_MAX_DRIVES as u8;
            self.send_interrupt = true;
        }
        self.control = control;
    }

    fn make_st0_byte(&self, interrupt_code: InterruptCode, drive_select: usize, head: u8, seek_end: bool) -> u8 {
        let mut st0 = interrupt_code.st0_bits() | (drive_select as u8 & 0x03);
        if head & 1 != 0 {
            st0 |= ST0_HEAD_ACTIVE;
        }
        if seek_end {
            st0 |= ST0_SEEK_END;
        }
        st0
    }

    fn send_results(&mut self, results: &[u8]) {
        log::trace!("FLOPPY: Result phase: {:02X?}", results);
        self.results.clear();
        self.results.extend(results.iter().copied());
        self.phase = ControllerPhase::Result;
    }

    fn drive_head_select(&self) -> DriveHeadSelect {
        DriveHeadSelect::from_bytes([self.command_bytes.get(1).copied().unwrap_or(0)])
    }

    fn command_specify(&mut self) -> Continuation {
        log::debug!(
            "FLOPPY: Specify: SRT/HUT: {:02X} HLT/ND: {:02X}",
            self.command_bytes[1],
            self.command_bytes[2]
        );
        Continuation::CommandComplete
    }

    fn command_sense_drive_status(&mut self) -> Continuation {
        let hs = self.drive_head_select();
        let drive_select = hs.drive() as usize;
        let drive = &self.drives[drive_select];

        let mut st3 = drive_select as u8 | ST3_DOUBLESIDED;
        if hs.head() != 0 {
            st3 |= ST3_HEAD;
        }
        if drive.cylinder() == 0 {
            st3 |= ST3_TRACK0;
        }
        if drive.is_ready() {
            st3 |= ST3_READY;
        }
        if drive.write_protected() {
            st3 |= ST3_WRITE_PROTECT;
        }
        self.send_results(&[st3]);
        Continuation::CommandComplete
    }

    fn seek_complete(&mut self, drive_select: usize, cylinder: u8) {
        let drive = &mut self.drives[drive_select];
        drive.seek(cylinder);
        let mut st0 = self.make_st0_byte(InterruptCode::NormalTermination, drive_select, 0, true);
        if !self.drives[drive_select].is_ready() {
            st0 |= InterruptCode::AbnormalTermination.st0_bits() | ST0_NOT_READY;
        }
        self.pending_seek[drive_select] = Some((st0, self.drives[drive_select].cylinder()));
        self.send_interrupt = true;
    }

    fn command_recalibrate(&mut self) -> Continuation {
        let drive_select = self.drive_head_select().drive() as usize;
        log::debug!("FLOPPY: Recalibrate drive {}", drive_select);
        self.seek_complete(drive_select, 0);
        Continuation::CommandComplete
    }

    fn command_seek_head(&mut self) -> Continuation {
        let drive_select = self.drive_head_select().drive() as usize;
        let cylinder = self.command_bytes[2];
        log::debug!("FLOPPY: Seek drive {} to cylinder {}", drive_select, cylinder);
        self.seek_complete(drive_select, cylinder);
        Continuation::CommandComplete
    }

    /// Report the reason for the last interrupt. After a controller reset, one polling status is
    /// reported per drive. Finished seeks are reported one per call, lowest drive first.
    pub fn command_sense_interrupt(&mut self) -> Continuation {
        if self.reset_sense_count > 0 {
            let drive_select = (FDC_MAX_DRIVES as u8 - self.reset_sense_count) as usize;
            self.reset_sense_count -= 1;
            let st0 = self.make_st0_byte(InterruptCode::AbnormalPolling, drive_select, 0, false);
            let pcn = self.drives[drive_select].cylinder();
            self.send_results(&[st0, pcn]);
        }
        else if let Some((st0, pcn)) = self.pending_seek.iter_mut().find_map(|p| p.take()) {
            self.send_results(&[st0, pcn]);
        }
        else {
            self.send_results(&[RESULT_INVALID]);
        }
        Continuation::CommandComplete
    }

    /// Finish a command immediately with a 7 byte result.
    fn terminate(&mut self, code: InterruptCode, drive_select: usize, head: u8, chrn: [u8; 4]) {
        let st0 = self.make_st0_byte(code, drive_select, head, false) | self.st0_flags;
        let (st1, st2) = (self.st1, self.st2);
        self.send_results(&[st0, st1, st2, chrn[0], chrn[1], chrn[2], chrn[3]]);
        self.send_interrupt = true;
    }

    fn start_operation(&mut self, kind: OperationKind) -> Continuation {
        let hs = self.drive_head_select();
        let b = &self.command_bytes;
        let command_byte = CommandByte::from_bytes([b[0]]);
        let mut op = Operation {
            kind,
            phase: OperationPhase::SearchId,
            drive: hs.drive() as usize,
            head: hs.head(),
            mt: command_byte.mt(),
            c: b[2],
            h: b[3],
            r: b[4],
            n: b[5],
            eot: b[6],
            index_pulses: 0,
            ids_seen: false,
            wrong_cylinder: false,
            marker: 0,
            skip: 0,
            words: 0,
            sectors: 0,
        };
        self.st0_flags = 0;
        self.st1 = 0;
        self.st2 = 0;
        self.more_data = false;

        let drive = &self.drives[op.drive];
        if !drive.is_ready() {
            // Reported from the periodic hook, as the drive would only time out there.
            op.kind = OperationKind::NotReady;
        }
        else if kind == OperationKind::WriteData && drive.write_protected() {
            log::debug!("FLOPPY: Write to write protected drive {}", op.drive);
            self.st1 = ST1_WRITE_PROTECT;
            self.terminate(
                InterruptCode::AbnormalTermination,
                op.drive,
                op.head,
                [op.c, op.h, op.r, op.n],
            );
            return Continuation::CommandComplete;
        }

        log::debug!(
            "FLOPPY: {:?} drive {} head {} C:{} H:{} R:{} N:{} EOT:{}",
            op.kind,
            op.drive,
            op.head,
            op.c,
            op.h,
            op.r,
            op.n,
            op.eot
        );
        self.operation = Some(op);
        Continuation::ContinueAsOperation
    }

    fn command_read_data(&mut self) -> Continuation {
        self.start_operation(OperationKind::ReadData)
    }

    fn command_write_data(&mut self) -> Continuation {
        self.start_operation(OperationKind::WriteData)
    }

    fn command_read_track(&mut self) -> Continuation {
        self.start_operation(OperationKind::ReadTrack)
    }

    fn command_read_sector_id(&mut self) -> Continuation {
        let hs = self.drive_head_select();
        let drive_select = hs.drive() as usize;
        let head = hs.head();
        self.st0_flags = 0;
        self.st1 = 0;
        self.st2 = 0;

        let drive = &mut self.drives[drive_select];
        if !drive.is_ready() {
            self.st0_flags = ST0_NOT_READY;
            self.terminate(InterruptCode::AbnormalTermination, drive_select, head, [0; 4]);
            return Continuation::CommandComplete;
        }

        drive.select_track(head);
        let start = drive.position();
        let found = (0..TRACK_WORDS).find_map(|i| drive.track().id_at(start + i));
        let cylinder = drive.cylinder();
        match found {
            Some(id) => {
                self.terminate(
                    InterruptCode::NormalTermination,
                    drive_select,
                    head,
                    [id.c, id.h, id.r, id.n],
                );
            }
            None => {
                self.st1 = ST1_NO_ID;
                self.terminate(
                    InterruptCode::AbnormalTermination,
                    drive_select,
                    head,
                    [cylinder, head, 0, 0],
                );
            }
        }
        Continuation::CommandComplete
    }

    fn command_format_track(&mut self) -> Continuation {
        let hs = self.drive_head_select();
        let drive_select = hs.drive() as usize;
        let head = hs.head();
        let n = self.command_bytes[2];
        let sectors = self.command_bytes[3];
        let fill = self.command_bytes[5];
        self.st0_flags = 0;
        self.st1 = 0;
        self.st2 = 0;

        let drive = &mut self.drives[drive_select];
        let cylinder = drive.cylinder();
        if !drive.is_ready() {
            self.st0_flags = ST0_NOT_READY;
            self.terminate(InterruptCode::AbnormalTermination, drive_select, head, [cylinder, head, 0, n]);
        }
        else if drive.write_protected() {
            self.st1 = ST1_WRITE_PROTECT;
            self.terminate(InterruptCode::AbnormalTermination, drive_select, head, [cylinder, head, 0, n]);
        }
        else {
            log::debug!(
                "FLOPPY: Format drive {} cylinder {} head {} fill {:02X}",
                drive_select,
                cylinder,
                head,
                fill
            );
            drive.format_track(head, fill);
            self.terminate(
                InterruptCode::NormalTermination,
                drive_select,
                head,
                [cylinder, head, sectors, n],
            );
        }
        Continuation::CommandComplete
    }

    /// Rotate every attached disk by one cell and service the transfer in progress.
    pub fn periodic(&mut self) {
        for drive in self.drives.iter_mut().filter(|d| d.is_ready()) {
            drive.rotate();
        }

        if self.phase != ControllerPhase::Executing {
            return;
        }
        let Some(mut op) = self.operation.take() else {
            return;
        };
        match self.step_operation(&mut op) {
            None => self.operation = Some(op),
            Some(code) => {
                log::debug!("FLOPPY: {:?} complete: {:?}", op.kind, code);
                self.more_data = false;
                self.terminate(code, op.drive, op.head, [op.c, op.h, op.r, op.n]);
            }
        }
    }

    /// Advance a transfer by one cell. Returns the termination code once the operation ends.
    fn step_operation(&mut self, op: &mut Operation) -> Option<InterruptCode> {
        let drive = &mut self.drives[op.drive];
        if op.kind == OperationKind::NotReady || !drive.is_ready() {
            self.st0_flags = ST0_NOT_READY;
            return Some(InterruptCode::AbnormalTermination);
        }

        drive.select_track(op.head);
        let pos = drive.position();
        if pos == 0 && op.phase != OperationPhase::Transfer {
            op.index_pulses += 1;
        }

        match op.phase {
            OperationPhase::SearchId => {
                if op.index_pulses >= SEARCH_REVOLUTIONS {
                    self.st1 |= if op.ids_seen { ST1_NODATA } else { ST1_NO_ID };
                    if op.wrong_cylinder {
                        self.st2 |= ST2_WRONG_CYLINDER;
                    }
                    return Some(InterruptCode::AbnormalTermination);
                }
                let id = drive.track().id_at(pos)?;
                op.ids_seen = true;
                let wanted = match op.kind {
                    OperationKind::ReadTrack => op.index_pulses > 0,
                    _ => id.c == op.c && id.h == op.h && id.r == op.r && id.n == op.n,
                };
                if !wanted {
                    op.wrong_cylinder |= id.c != op.c;
                    return None;
                }
                if !id.crc_ok {
                    self.st1 |= ST1_CRC;
                    return Some(InterruptCode::AbnormalTermination);
                }
                op.phase = OperationPhase::SearchData;
            }
            OperationPhase::SearchData => match drive.track().mark_at(pos) {
                Some(mark @ (DATA_ADDRESS_MARK | DELETED_DATA_ADDRESS_MARK)) => {
                    if mark == DELETED_DATA_ADDRESS_MARK {
                        self.st2 |= ST2_CONTROL_MARK;
                    }
                    op.phase = OperationPhase::Transfer;
                    op.marker = pos;
                    op.skip = 1;
                    op.words = 0;
                    self.more_data = op.kind == OperationKind::WriteData;
                }
                Some(_) => {
                    self.st1 |= ST1_NO_ID;
                    self.st2 |= ST2_NO_DAM;
                    return Some(InterruptCode::AbnormalTermination);
                }
                None => {}
            },
            OperationPhase::Transfer => {
                if op.skip > 0 {
                    op.skip -= 1;
                    return None;
                }
                if op.words == SECTOR_WORDS {
                    // The CRC cell is under the head.
                    if op.kind == OperationKind::WriteData {
                        drive.track_mut().update_data_crc(op.marker);
                    }
                    else {
                        if self.more_data {
                            self.st1 |= ST1_OVERRUN;
                            return Some(InterruptCode::AbnormalTermination);
                        }
                        if !drive.track().data_crc_ok(op.marker) {
                            self.st1 |= ST1_CRC;
                            self.st2 |= ST2_DATA_CRC;
                            return Some(InterruptCode::AbnormalTermination);
                        }
                    }
                    return Self::next_sector(op);
                }

                if self.more_data {
                    log::debug!("FLOPPY: Data overrun at word {}", op.words);
                    self.st1 |= ST1_OVERRUN;
                    return Some(InterruptCode::AbnormalTermination);
                }
                match op.kind {
                    OperationKind::WriteData => drive.track_mut().set_word(pos, self.data_word),
                    _ => self.data_word = drive.track().word(pos),
                }
                op.words += 1;
                self.more_data = op.kind != OperationKind::WriteData || op.words < SECTOR_WORDS;
            }
        }
        None
    }

    /// Move on to the next sector, or terminate at the end of the track. On normal termination
    /// the result reports the sector following the last one transferred.
    fn next_sector(op: &mut Operation) -> Option<InterruptCode> {
        op.sectors += 1;
        let at_end = match op.kind {
            OperationKind::ReadTrack => op.sectors >= op.eot as usize,
            _ => op.r >= op.eot,
        };

        op.phase = OperationPhase::SearchId;
        if !at_end {
            op.r = op.r.wrapping_add(1);
            if op.kind != OperationKind::ReadTrack {
                op.index_pulses = 0;
            }
            return None;
        }

        if op.mt && op.head == 0 && op.kind != OperationKind::ReadTrack {
            op.head = 1;
            op.h ^= 1;
            op.r = 1;
            op.index_pulses = 0;
            return None;
        }

        op.r = 1;
        op.c = op.c.wrapping_add(1);
        if op.mt {
            op.h ^= 1;
        }
        Some(InterruptCode::NormalTermination)
    }
}
