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

    bus::mod.rs

    Implements the board bus. The bus owns RAM, ROM, the segment
    descriptor registers and every peripheral. It exposes the CpuBus
    trait to the processor, and routes I/O window accesses to the
    peripheral that claims the port.

*/

pub mod io;
pub mod memory;

use fxhash::FxHashMap;
use thiserror::Error;

use crate::{
    breakpoints::WatchSet,
    devices::{
        ata::AtaController,
        fdc::FloppyController,
        keyboard::Keyboard,
        lpt_port::ParallelPort,
        pic::Pic,
        pit::Pit,
        rtc::Rtc,
        serial::SerialPort,
    },
};

pub use memory::{translate, MemoryKind};

pub const ROM_SIZE: usize = 0x4000;
pub const SEGMENT_COUNT: usize = 8;

/// Interrupt controller input assignments.
pub const IRQ_FRAME_TIMER: u8 = 0;
pub const IRQ_PIT: u8 = 1;
pub const IRQ_KEYBOARD: u8 = 2;
pub const IRQ_SERIAL: u8 = 3;
pub const IRQ_PARALLEL: u8 = 4;
pub const IRQ_FLOPPY: u8 = 5;
pub const IRQ_HARD_DISK: u8 = 6;
pub const IRQ_RTC: u8 = 7;

/// A recoverable bus condition. The processor turns any of these into its own memory fault trap.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Access denied by segment descriptor at address {0:06o}")]
    Denied(u16),
    #[error("No device responds at port {0:06o}")]
    UnmappedPort(u16),
    #[error("Emulated I/O access in USER mode at address {0:06o}")]
    EmulatedIo(u16),
    #[error("Write to read-only memory at address {0:06o}")]
    ReadOnly(u16),
}

/// Memory access interface presented to the processor.
pub trait CpuBus {
    /// Read a word. `exec` is set for instruction fetches.
    fn read_word(&mut self, address: u16, halt: bool, exec: bool) -> Result<u16, BusError>;
    fn read_byte(&mut self, address: u16, halt: bool) -> Result<u8, BusError>;
    fn write_word(&mut self, address: u16, halt: bool, data: u16) -> Result<(), BusError>;
    fn write_byte(&mut self, address: u16, halt: bool, data: u8) -> Result<(), BusError>;
}

/// A device reachable through the I/O window. All board registers are 16 bits wide; byte writes
/// are widened by the bus before they reach the device.
pub trait IoDevice {
    /// Read a register. Reads may have side effects (FIFO pops, latch release).
    fn read_u16(&mut self, port: u16) -> u16;

    fn write_u16(&mut self, port: u16, data: u16);

    /// Return the value a read of the specified port would produce, without side effects.
    /// The default implementation returns None, meaning the register cannot be peeked.
    fn peek_u16(&self, _port: u16) -> Option<u16> {
        None
    }

    /// Return a list of ports the device should service, comprised of a vector of tuples of
    /// (port description, port number).
    fn port_list(&self) -> Vec<(String, u16)>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoDeviceType {
    Pic,
    Pit,
    Keyboard,
    Parallel,
    Serial,
    FloppyController,
    Sound,
    HaltSegments,
    UserSegments,
    Rtc,
    HardDiskController,
}

#[macro_export]
macro_rules! add_io_device {
    ($self:expr, $device:expr, $device_type:expr) => {{
        let port_list = $device.port_list();
        $self.io_desc_map.extend(port_list.iter().map(|p| (p.1, p.0.clone())));
        $self.io_map.extend(port_list.into_iter().map(|p| (p.1, $device_type)));
    }};
}

pub struct BusInterface {
    ram: Vec<u8>,
    rom: Vec<u8>,
    hr: [u16; SEGMENT_COUNT],
    ur: [u16; SEGMENT_COUNT],

    io_map: FxHashMap<u16, IoDeviceType>,
    io_desc_map: FxHashMap<u16, String>,

    pic: Pic,
    pit: Pit,
    keyboard: Keyboard,
    serial: SerialPort,
    parallel: ParallelPort,
    fdc: Option<FloppyController>,
    ata: AtaController,
    rtc: Rtc,
    sound_register: u16,

    watches: WatchSet,
    watch_hit: Option<u16>,
    fault: Option<BusError>,
}

impl BusInterface {
    pub fn new(ram_size: usize, floppy_controller: bool) -> Self {
        let mut bus = BusInterface {
            ram: vec![0; ram_size],
            rom: vec![0; ROM_SIZE],
            hr: [0; SEGMENT_COUNT],
            ur: [0; SEGMENT_COUNT],
            io_map: FxHashMap::default(),
            io_desc_map: FxHashMap::default(),
            pic: Pic::new(),
            pit: Pit::new(),
            keyboard: Keyboard::new(),
            serial: SerialPort::new(),
            parallel: ParallelPort::new(),
            fdc: floppy_controller.then(FloppyController::new),
            ata: AtaController::new(),
            rtc: Rtc::new(),
            sound_register: 0,
            watches: WatchSet::default(),
            watch_hit: None,
            fault: None,
        };
        bus.install_devices();
        bus
    }

    fn install_devices(&mut self) {
        add_io_device!(self, self.pic, IoDeviceType::Pic);
        add_io_device!(self, self.pit, IoDeviceType::Pit);
        add_io_device!(self, self.keyboard, IoDeviceType::Keyboard);
        add_io_device!(self, self.parallel, IoDeviceType::Parallel);
        add_io_device!(self, self.serial, IoDeviceType::Serial);
        if let Some(fdc) = &self.fdc {
            add_io_device!(self, fdc, IoDeviceType::FloppyController);
        }
        add_io_device!(self, self.rtc, IoDeviceType::Rtc);
        add_io_device!(self, self.ata, IoDeviceType::HardDiskController);

        self.io_map.insert(io::SOUND_PORT, IoDeviceType::Sound);
        self.io_desc_map.insert(io::SOUND_PORT, String::from("Sound DAC"));
        for n in 0..SEGMENT_COUNT as u16 {
            let hr_port = io::HR_BASE_PORT + n * 2;
            let ur_port = io::UR_BASE_PORT + n * 2;
            self.io_map.insert(hr_port, IoDeviceType::HaltSegments);
            self.io_desc_map.insert(hr_port, format!("HALT Segment Descriptor {n}"));
            self.io_map.insert(ur_port, IoDeviceType::UserSegments);
            self.io_desc_map.insert(ur_port, format!("USER Segment Descriptor {n}"));
        }
        log::debug!("Installed {} I/O ports", self.io_map.len());
    }

    /// Return the description of the device register at the specified port, if one is mapped.
    pub fn port_description(&self, port: u16) -> Option<&str> {
        self.io_desc_map.get(&port).map(|s| s.as_str())
    }

    /// Reset all peripherals and segment registers. RAM and ROM contents survive.
    pub fn reset(&mut self) {
        self.hr = [0; SEGMENT_COUNT];
        self.ur = [0; SEGMENT_COUNT];
        self.pic.reset();
        self.pit.reset();
        self.keyboard.reset();
        self.serial.reset();
        self.parallel.reset();
        if let Some(fdc) = &mut self.fdc {
            fdc.reset();
        }
        self.ata.reset();
        self.rtc.reset();
        self.sound_register = 0;
        self.watch_hit = None;
        self.fault = None;
    }

    /// Forward pending device interrupt requests to the interrupt controller.
    pub fn service_interrupts(&mut self) {
        if self.keyboard.take_interrupt() {
            self.pic.set_signal(IRQ_KEYBOARD);
        }
        if self.serial.take_interrupt() {
            self.pic.set_signal(IRQ_SERIAL);
        }
        if self.parallel.take_interrupt() {
            self.pic.set_signal(IRQ_PARALLEL);
        }
        if let Some(fdc) = &mut self.fdc {
            if fdc.take_interrupt() {
                self.pic.set_signal(IRQ_FLOPPY);
            }
        }
        if self.ata.take_interrupt() {
            self.pic.set_signal(IRQ_HARD_DISK);
        }
        if self.rtc.take_interrupt() {
            self.pic.set_signal(IRQ_RTC);
        }
    }

    /// Advance the interval timer and the hard disk timeout by one frame tick.
    pub fn tick_devices(&mut self) {
        let edges = self.pit.tick();
        if edges & 0x01 != 0 {
            self.pic.set_signal(IRQ_PIT);
        }
        self.ata.tick();
        self.service_interrupts();
    }

    /// The 50Hz frame timer hook.
    pub fn frame_timer(&mut self) {
        self.pic.set_signal(IRQ_FRAME_TIMER);
        self.rtc.check_alarm();
        self.service_interrupts();
    }

    /// The floppy controller's periodic hook. Does nothing if no floppy controller is installed.
    pub fn floppy_periodic(&mut self) {
        if let Some(fdc) = &mut self.fdc {
            fdc.periodic();
        }
        self.service_interrupts();
    }

    /// Return the state of the interrupt controller's request line.
    #[inline]
    pub fn intr(&self) -> bool {
        self.pic.intr()
    }

    /// Return the sound DAC level and the speaker level driven by timer channel 2.
    pub fn sound_levels(&self) -> (u8, bool) {
        (self.sound_register as u8, self.pit.output(2))
    }

    pub fn set_watches(&mut self, watches: WatchSet) {
        self.watches = watches;
        self.watch_hit = None;
    }

    /// Return and clear the address of the last watched write.
    pub fn take_watch_hit(&mut self) -> Option<u16> {
        self.watch_hit.take()
    }

    /// Return and clear the last bus fault raised by a processor access.
    pub fn take_fault(&mut self) -> Option<BusError> {
        self.fault.take()
    }

    #[inline]
    fn latch<T>(&mut self, result: Result<T, BusError>) -> Result<T, BusError> {
        if let Err(e) = &result {
            log::trace!("Bus fault: {}", e);
            self.fault = Some(*e);
        }
        result
    }

    pub fn hr(&self) -> &[u16; SEGMENT_COUNT] {
        &self.hr
    }

    pub fn ur(&self) -> &[u16; SEGMENT_COUNT] {
        &self.ur
    }

    pub fn set_hr(&mut self, hr: [u16; SEGMENT_COUNT]) {
        self.hr = hr;
    }

    pub fn set_ur(&mut self, ur: [u16; SEGMENT_COUNT]) {
        self.ur = ur;
    }

    pub fn pic(&self) -> &Pic {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut Pic {
        &mut self.pic
    }

    pub fn pit(&self) -> &Pit {
        &self.pit
    }

    pub fn pit_mut(&mut self) -> &mut Pit {
        &mut self.pit
    }

    pub fn keyboard_mut(&mut self) -> &mut Keyboard {
        &mut self.keyboard
    }

    pub fn serial_mut(&mut self) -> &mut SerialPort {
        &mut self.serial
    }

    pub fn parallel_mut(&mut self) -> &mut ParallelPort {
        &mut self.parallel
    }

    pub fn fdc(&self) -> &Option<FloppyController> {
        &self.fdc
    }

    pub fn fdc_mut(&mut self) -> &mut Option<FloppyController> {
        &mut self.fdc
    }

    pub fn ata(&self) -> &AtaController {
        &self.ata
    }

    pub fn ata_mut(&mut self) -> &mut AtaController {
        &mut self.ata
    }

    pub fn rtc(&self) -> &Rtc {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut Rtc {
        &mut self.rtc
    }
}

impl BusInterface {
    fn cpu_read_word(&mut self, address: u16, halt: bool, exec: bool) -> Result<u16, BusError> {
        let address = address & !1;
        match self.translate(address, halt, exec) {
            (MemoryKind::Ram, offset) => Ok(self.ram_word(offset)),
            (MemoryKind::Rom, offset) => Ok(self.rom_word(offset)),
            (MemoryKind::Io, _) => self.read_port(address),
            (MemoryKind::EmulatedIo, _) => Err(BusError::EmulatedIo(address)),
            (MemoryKind::Deny, _) => Err(BusError::Denied(address)),
        }
    }

    fn cpu_read_byte(&mut self, address: u16, halt: bool) -> Result<u8, BusError> {
        let shift = (address & 1) * 8;
        match self.translate(address, halt, false) {
            (MemoryKind::Ram, offset) => Ok(self.ram[offset]),
            (MemoryKind::Rom, offset) => Ok(self.rom[offset]),
            (MemoryKind::Io, _) => self.read_port(address & !1).map(|w| (w >> shift) as u8),
            (MemoryKind::EmulatedIo, _) => Err(BusError::EmulatedIo(address)),
            (MemoryKind::Deny, _) => Err(BusError::Denied(address)),
        }
    }

    fn cpu_write_word(&mut self, address: u16, halt: bool, data: u16) -> Result<(), BusError> {
        let address = address & !1;
        match self.translate(address, halt, false) {
            (MemoryKind::Ram, offset) => {
                self.set_ram_word(offset, data);
                self.check_watch(address);
                Ok(())
            }
            (MemoryKind::Rom, _) => Err(BusError::ReadOnly(address)),
            (MemoryKind::Io, _) => self.write_port(address, data),
            (MemoryKind::EmulatedIo, _) => Err(BusError::EmulatedIo(address)),
            (MemoryKind::Deny, _) => Err(BusError::Denied(address)),
        }
    }

    fn cpu_write_byte(&mut self, address: u16, halt: bool, data: u8) -> Result<(), BusError> {
        match self.translate(address, halt, false) {
            (MemoryKind::Ram, offset) => {
                self.ram[offset] = data;
                self.check_watch(address);
                Ok(())
            }
            (MemoryKind::Rom, _) => Err(BusError::ReadOnly(address)),
            (MemoryKind::Io, _) => {
                if address & 1 == 0 {
                    self.write_port(address, data as u16)
                }
                else {
                    self.write_port(address & !1, (data as u16) << 8)
                }
            }
            (MemoryKind::EmulatedIo, _) => Err(BusError::EmulatedIo(address)),
            (MemoryKind::Deny, _) => Err(BusError::Denied(address)),
        }
    }
}

impl CpuBus for BusInterface {
    fn read_word(&mut self, address: u16, halt: bool, exec: bool) -> Result<u16, BusError> {
        let result = self.cpu_read_word(address, halt, exec);
        self.latch(result)
    }

    fn read_byte(&mut self, address: u16, halt: bool) -> Result<u8, BusError> {
        let result = self.cpu_read_byte(address, halt);
        self.latch(result)
    }

    fn write_word(&mut self, address: u16, halt: bool, data: u16) -> Result<(), BusError> {
        let result = self.cpu_write_word(address, halt, data);
        self.latch(result)
    }

    fn write_byte(&mut self, address: u16, halt: bool, data: u8) -> Result<(), BusError> {
        let result = self.cpu_write_byte(address, halt, data);
        self.latch(result)
    }
}
