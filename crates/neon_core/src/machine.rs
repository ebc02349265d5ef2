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

    machine.rs

    Implements the Motherboard, the frame scheduler that interleaves the
    processor's micro-steps with the peripheral hooks.

    One frame is FRAME_TICKS ticks. Each tick issues a fixed number of
    processor micro-steps, then advances the interval timer and the hard
    disk timeout, then runs the 50Hz, floppy and sound hooks when their
    tick counters come due.

*/

use std::path::Path;

use anyhow::{anyhow, Error};

use crate::{
    breakpoints::{BreakpointSet, WatchSet},
    bus::{BusInterface, SEGMENT_COUNT},
    cpu_common::Processor,
    device_traits::{
        serialdevice::{ParallelDevice, SerialDevice},
        sounddevice::{NullSoundDevice, SoundDevice},
    },
    machine_config::MachineConfiguration,
    snapshot::{MachineSnapshot, SNAPSHOT_VERSION},
};

pub const FRAME_TICKS: u32 = 20000;
/// Ticks between 50Hz frame timer signals.
pub const TIMER_50HZ_TICKS: u32 = 10000;
/// Ticks between floppy controller periodic calls.
pub const FLOPPY_PERIODIC_TICKS: u32 = 32;
/// Sound hook calls per second are derived from this many hook calls per frame-rate unit.
const SOUND_RATE_DIVISOR: u32 = 25;

/// Reason run_frame() returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameResult {
    Completed,
    /// The program counter matched a breakpoint after a micro-step.
    Breakpoint(u16),
    /// The processor wrote a watched address.
    Watchpoint(u16),
}

/// Ticks between sound hook calls for a host sample rate.
pub fn sound_interval(sample_rate: u32) -> u32 {
    let samples_per_frame = (sample_rate / SOUND_RATE_DIVISOR).max(1);
    (FRAME_TICKS / samples_per_frame).max(1)
}

pub struct Motherboard {
    config: MachineConfiguration,
    bus: BusInterface,
    cpu: Box<dyn Processor>,
    sound: Box<dyn SoundDevice>,
    breakpoints: BreakpointSet,

    steps_per_tick: u32,
    sound_interval: u32,
    frame_count: u64,
}

impl Motherboard {
    /// Build a board for the given configuration and attach the images it names.
    pub fn new(config: MachineConfiguration, cpu: Box<dyn Processor>) -> Result<Self, Error> {
        config.validate()?;

        let bus = BusInterface::new(config.ram.bytes(), config.floppy_controller);
        let mut board = Motherboard {
            steps_per_tick: config.steps_per_tick(),
            sound_interval: sound_interval(config.sound_sample_rate),
            config,
            bus,
            cpu,
            sound: Box::new(NullSoundDevice),
            breakpoints: BreakpointSet::default(),
            frame_count: 0,
        };

        let floppies = board.config.floppy.clone();
        for (drive, path) in floppies.iter().enumerate() {
            board.attach_floppy(drive, path)?;
        }
        if let Some(path) = board.config.hard_drive.clone() {
            board.attach_hard_drive(&path)?;
        }

        log::debug!(
            "Created {} with {}K RAM, {} steps per tick, sound hook every {} ticks",
            board.config.machine_type,
            board.config.ram.bytes() / 1024,
            board.steps_per_tick,
            board.sound_interval
        );
        Ok(board)
    }

    pub fn config(&self) -> &MachineConfiguration {
        &self.config
    }

    pub fn bus(&self) -> &BusInterface {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusInterface {
        &mut self.bus
    }

    pub fn cpu(&self) -> &dyn Processor {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn Processor {
        self.cpu.as_mut()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn set_sound_device(&mut self, device: Box<dyn SoundDevice>) {
        self.sound = device;
    }

    pub fn attach_serial_device(&mut self, device: Box<dyn SerialDevice>) {
        self.bus.serial_mut().attach(device);
    }

    pub fn attach_parallel_device(&mut self, device: Box<dyn ParallelDevice>) {
        self.bus.parallel_mut().attach(device);
    }

    /// Power-on reset of the processor and every peripheral. Memory contents survive.
    pub fn reset(&mut self) {
        log::debug!("Board reset");
        self.bus.reset();
        self.cpu.reset();
        self.cpu.set_halt_pin(false);
    }

    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), Error> {
        self.bus.load_rom(image)
    }

    pub fn load_rom_file(&mut self, path: &Path) -> Result<(), Error> {
        let image = std::fs::read(path).map_err(|e| anyhow!("Couldn't read ROM image {}: {}", path.display(), e))?;
        self.bus.load_rom(&image)
    }

    pub fn attach_floppy(&mut self, drive: usize, path: &Path) -> Result<(), Error> {
        match self.bus.fdc_mut() {
            Some(fdc) => fdc.attach_image(drive, path),
            None => Err(anyhow!("No floppy controller installed")),
        }
    }

    /// Attach a floppy image write protected.
    pub fn attach_floppy_read_only(&mut self, drive: usize, path: &Path) -> Result<(), Error> {
        match self.bus.fdc_mut() {
            Some(fdc) => fdc.attach_image_read_only(drive, path),
            None => Err(anyhow!("No floppy controller installed")),
        }
    }

    pub fn detach_floppy(&mut self, drive: usize) {
        if let Some(fdc) = self.bus.fdc_mut() {
            fdc.detach_image(drive);
        }
    }

    pub fn attach_hard_drive(&mut self, path: &Path) -> Result<(), Error> {
        self.bus.ata_mut().attach_image(path)
    }

    pub fn attach_hard_drive_read_only(&mut self, path: &Path) -> Result<(), Error> {
        self.bus.ata_mut().attach_image_read_only(path)
    }

    pub fn detach_hard_drive(&mut self) {
        self.bus.ata_mut().detach_image();
    }

    pub fn set_breakpoints(&mut self, breakpoints: BreakpointSet) {
        self.breakpoints = breakpoints;
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn set_watches(&mut self, watches: WatchSet) {
        self.bus.set_watches(watches);
    }

    /// Side-effect free word read, as seen in the given processor mode.
    pub fn peek_word(&self, address: u16, halt: bool) -> Option<u16> {
        self.bus.peek_word(address, halt)
    }

    pub fn ram(&self) -> &[u8] {
        self.bus.ram()
    }

    pub fn hr(&self) -> &[u16; SEGMENT_COUNT] {
        self.bus.hr()
    }

    pub fn ur(&self) -> &[u16; SEGMENT_COUNT] {
        self.bus.ur()
    }

    /// Queue a scan code from the host keyboard.
    pub fn key_event(&mut self, scancode: u8) {
        self.bus.keyboard_mut().push_scancode(scancode);
        self.bus.service_interrupts();
    }

    /// Deliver a byte received on the serial line.
    pub fn serial_receive(&mut self, byte: u8) {
        self.bus.serial_mut().receive(byte);
        self.bus.service_interrupts();
    }

    /// Raise a vectored interrupt directly on the processor.
    pub fn raise_virq(&mut self, level: u8, vector: u16) {
        log::debug!("VIRQ level {} vector {:03o}", level, vector);
        self.cpu.interrupt_virq(level, vector);
    }

    #[inline]
    fn sync_halt_pin(&mut self) {
        self.cpu.set_halt_pin(self.bus.intr());
    }

    /// Run one processor micro-step and report a stop condition, if any.
    #[inline]
    fn step(&mut self) -> Option<FrameResult> {
        self.cpu.execute(&mut self.bus);
        if self.bus.take_fault().is_some() {
            self.cpu.memory_error();
        }
        self.sync_halt_pin();

        if let Some(address) = self.bus.take_watch_hit() {
            return Some(FrameResult::Watchpoint(address));
        }
        // Compared after every micro-step; the processor keeps its internal tick so a stop
        // inside an instruction resumes where it left off.
        let pc = self.cpu.pc();
        if self.breakpoints.contains(pc) {
            return Some(FrameResult::Breakpoint(pc));
        }
        None
    }

    /// Run one video frame. Returns early, with every device exactly as of the stopping micro-step,
    /// when a breakpoint or watch is hit. Each call starts a fresh frame.
    pub fn run_frame(&mut self) -> FrameResult {
        for tick in 0..FRAME_TICKS {
            for _ in 0..self.steps_per_tick {
                if let Some(stop) = self.step() {
                    log::debug!("Frame {} stopped at tick {}: {:?}", self.frame_count, tick, stop);
                    return stop;
                }
            }

            self.bus.tick_devices();

            if tick % TIMER_50HZ_TICKS == 0 {
                self.bus.frame_timer();
            }
            if self.config.floppy_controller && tick % FLOPPY_PERIODIC_TICKS == 0 {
                self.bus.floppy_periodic();
            }
            if tick % self.sound_interval == 0 {
                let (dac, speaker) = self.bus.sound_levels();
                self.sound.sample(dac, speaker);
            }

            self.sync_halt_pin();
        }
        self.frame_count += 1;
        FrameResult::Completed
    }

    pub fn save_state(&self) -> MachineSnapshot {
        MachineSnapshot {
            version: SNAPSHOT_VERSION,
            machine_type: self.config.machine_type,
            ram_size: self.config.ram,
            ram: self.bus.ram().to_vec(),
            rom: self.bus.rom().to_vec(),
            hr: *self.bus.hr(),
            ur: *self.bus.ur(),
            pic: self.bus.pic().clone(),
            pit: self.bus.pit().clone(),
            rtc: self.bus.rtc().clone(),
        }
    }

    /// Restore a snapshot taken from a board of the same configuration. The processor resumes at
    /// an instruction boundary.
    pub fn load_state(&mut self, snapshot: &MachineSnapshot) -> Result<(), Error> {
        if snapshot.machine_type != self.config.machine_type || snapshot.ram_size != self.config.ram {
            return Err(anyhow!(
                "Snapshot is for {} with {:?}, board is {} with {:?}",
                snapshot.machine_type,
                snapshot.ram_size,
                self.config.machine_type,
                self.config.ram
            ));
        }
        self.bus.restore_memory(&snapshot.ram, &snapshot.rom)?;
        self.bus.set_hr(snapshot.hr);
        self.bus.set_ur(snapshot.ur);
        *self.bus.pic_mut() = snapshot.pic.clone();
        *self.bus.pit_mut() = snapshot.pit.clone();
        self.bus.rtc_mut().restore(snapshot.rtc.clone());
        self.cpu.clear_internal_tick();
        self.sync_halt_pin();
        Ok(())
    }
}
