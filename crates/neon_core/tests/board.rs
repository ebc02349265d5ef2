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

    tests::board.rs

    Board level tests. A scripted processor stands in for the instruction
    execution engine and drives the bus the way firmware would.

*/

use std::{
    cell::{Cell, RefCell},
    io::Write,
    rc::Rc,
};

use neon_core::{
    breakpoints::{BreakpointSet, WatchSet},
    bus::{BusInterface, CpuBus},
    cpu_common::{Processor, REGISTER_PC},
    device_traits::{serialdevice::SerialDevice, sounddevice::SoundDevice},
    devices::{
        ata::ata_device::{
            IDE_BASE_PORT, IDE_REG_DATA, IDE_REG_DRIVE_HEAD, IDE_REG_ERROR, IDE_REG_SECTOR_COUNT, IDE_REG_STATUS,
        },
        fdc::{
            controller::{ControllerPhase, FDC_DATA_PORT, FDC_STATUS_PORT},
            track::{SECTOR_SIZE, TRACK_IMAGE_BYTES},
        },
        keyboard::KEYBOARD_DATA_PORT,
        pic::{PIC_COMMAND_PORT, PIC_MASK_PORT},
        serial::SERIAL_DATA_PORT,
    },
    machine::{sound_interval, FRAME_TICKS},
    machine_config::MachineConfiguration,
    machine_types::MachineType,
    FrameResult,
    Motherboard,
};

type Script = Box<dyn FnMut(u64, &mut dyn CpuBus)>;

#[derive(Default)]
struct Probe {
    steps: Cell<u64>,
    halt_pin: Cell<bool>,
    memory_errors: Cell<u32>,
    virqs: RefCell<Vec<(u8, u16)>>,
}

/// Advances the program counter by one word per micro-step and runs an optional script against
/// the bus.
struct ScriptedCpu {
    regs: [u16; 8],
    probe: Rc<Probe>,
    script: Option<Script>,
}

impl ScriptedCpu {
    fn new(script: Option<Script>) -> (Box<Self>, Rc<Probe>) {
        let probe = Rc::new(Probe::default());
        let cpu = ScriptedCpu {
            regs: [0; 8],
            probe: probe.clone(),
            script,
        };
        (Box::new(cpu), probe)
    }
}

impl Processor for ScriptedCpu {
    fn execute(&mut self, bus: &mut dyn CpuBus) {
        let step = self.probe.steps.get() + 1;
        self.probe.steps.set(step);
        self.regs[REGISTER_PC] = self.regs[REGISTER_PC].wrapping_add(2);
        if let Some(script) = &mut self.script {
            script(step, bus);
        }
    }

    fn reset(&mut self) {
        self.regs = [0; 8];
    }

    fn reg(&self, reg: usize) -> u16 {
        self.regs[reg]
    }

    fn set_reg(&mut self, reg: usize, value: u16) {
        self.regs[reg] = value;
    }

    fn is_halt_mode(&self) -> bool {
        true
    }

    fn set_halt_pin(&mut self, state: bool) {
        self.probe.halt_pin.set(state);
    }

    fn memory_error(&mut self) {
        self.probe.memory_errors.set(self.probe.memory_errors.get() + 1);
    }

    fn interrupt_virq(&mut self, level: u8, vector: u16) {
        self.probe.virqs.borrow_mut().push((level, vector));
    }

    fn internal_tick(&self) -> u16 {
        0
    }

    fn clear_internal_tick(&mut self) {}
}

fn board(config: MachineConfiguration, script: Option<Script>) -> (Motherboard, Rc<Probe>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (cpu, probe) = ScriptedCpu::new(script);
    (Motherboard::new(config, cpu).unwrap(), probe)
}

fn init_pic(bus: &mut dyn CpuBus, mask: u16) {
    bus.write_word(PIC_COMMAND_PORT, true, 0o23).unwrap();
    bus.write_word(PIC_MASK_PORT, true, 0o100).unwrap();
    bus.write_word(PIC_MASK_PORT, true, mask).unwrap();
}

#[test]
fn test_frame_runs_exact_step_count() {
    let (mut board, probe) = board(MachineConfiguration::default(), None);
    assert_eq!(board.run_frame(), FrameResult::Completed);
    assert_eq!(probe.steps.get(), FRAME_TICKS as u64 * 8);
    assert_eq!(board.frame_count(), 1);

    let config = MachineConfiguration {
        machine_type: MachineType::Pk11_16Turbo,
        ..Default::default()
    };
    let (mut board, probe) = self::board(config, None);
    assert_eq!(board.run_frame(), FrameResult::Completed);
    assert_eq!(probe.steps.get(), FRAME_TICKS as u64 * 16);
}

#[test]
fn test_breakpoint_stops_after_matching_step() {
    let (mut board, probe) = board(MachineConfiguration::default(), None);
    board.set_breakpoints(BreakpointSet::from_sentinel_list(&[2000, 0o177777]));

    assert_eq!(board.run_frame(), FrameResult::Breakpoint(2000));
    assert_eq!(probe.steps.get(), 1000);
    assert_eq!(board.frame_count(), 0);

    // The next frame resumes; the program counter wraps around to the breakpoint again.
    assert_eq!(board.run_frame(), FrameResult::Breakpoint(2000));
    assert_eq!(probe.steps.get(), 1000 + 32768);

    board.set_breakpoints(BreakpointSet::default());
    assert_eq!(board.run_frame(), FrameResult::Completed);
}

/// Each instruction takes four micro-steps. The program counter advances on the first one and the
/// internal tick counts down over the other three.
struct MultiStepCpu {
    regs: [u16; 8],
    tick: u16,
    steps: Rc<Cell<u64>>,
}

impl Processor for MultiStepCpu {
    fn execute(&mut self, _bus: &mut dyn CpuBus) {
        self.steps.set(self.steps.get() + 1);
        if self.tick == 0 {
            self.regs[REGISTER_PC] = self.regs[REGISTER_PC].wrapping_add(2);
            self.tick = 3;
        }
        else {
            self.tick -= 1;
        }
    }

    fn reset(&mut self) {
        self.regs = [0; 8];
        self.tick = 0;
    }

    fn reg(&self, reg: usize) -> u16 {
        self.regs[reg]
    }

    fn set_reg(&mut self, reg: usize, value: u16) {
        self.regs[reg] = value;
    }

    fn is_halt_mode(&self) -> bool {
        true
    }

    fn set_halt_pin(&mut self, _state: bool) {}

    fn memory_error(&mut self) {}

    fn interrupt_virq(&mut self, _level: u8, _vector: u16) {}

    fn internal_tick(&self) -> u16 {
        self.tick
    }

    fn clear_internal_tick(&mut self) {
        self.tick = 0;
    }
}

#[test]
fn test_breakpoint_stops_inside_instruction() {
    let steps = Rc::new(Cell::new(0));
    let cpu = Box::new(MultiStepCpu {
        regs: [0; 8],
        tick: 0,
        steps: steps.clone(),
    });
    let mut board = Motherboard::new(MachineConfiguration::default(), cpu).unwrap();
    board.set_breakpoints(BreakpointSet::from_iter([2]));

    assert_eq!(board.run_frame(), FrameResult::Breakpoint(2));
    assert_eq!(steps.get(), 1);
    assert_eq!(board.cpu().internal_tick(), 3);

    // The next frame picks the instruction up where it stopped.
    assert_eq!(board.run_frame(), FrameResult::Breakpoint(2));
    assert_eq!(steps.get(), 2);
    assert_eq!(board.cpu().internal_tick(), 2);

    board.set_breakpoints(BreakpointSet::from_iter([4]));
    assert_eq!(board.run_frame(), FrameResult::Breakpoint(4));
    assert_eq!(steps.get(), 5);
    assert_eq!(board.cpu().internal_tick(), 3);
}

#[test]
fn test_watchpoint_stops_on_write() {
    let script: Script = Box::new(|step, bus| {
        if step == 5 {
            bus.write_word(0o1000, false, 0o123456).unwrap();
        }
    });
    let (mut board, probe) = board(MachineConfiguration::default(), Some(script));
    board.set_watches(WatchSet::from_iter([0o1000]));

    assert_eq!(board.run_frame(), FrameResult::Watchpoint(0o1000));
    assert_eq!(probe.steps.get(), 5);
    assert_eq!(board.peek_word(0o1000, false), Some(0o123456));
    assert_eq!(&board.ram()[0o1000..0o1002], &0o123456u16.to_le_bytes());
}

#[test]
fn test_bus_fault_signals_memory_error() {
    let script: Script = Box::new(|step, bus| {
        if step == 1 {
            assert!(bus.read_word(0o160000, true, false).is_err());
        }
        if step == 2 {
            // Segment 1 denied in USER mode.
            bus.write_word(0o161222, true, 0x0001).unwrap();
            assert!(bus.read_word(0o20000, false, false).is_err());
        }
    });
    let (mut board, probe) = board(MachineConfiguration::default(), Some(script));
    board.run_frame();
    assert_eq!(probe.memory_errors.get(), 2);
    assert_eq!(board.ur()[1], 0x0001);
}

#[test]
fn test_frame_timer_raises_halt_pin() {
    let script: Script = Box::new(|step, bus| {
        if step == 1 {
            init_pic(bus, 0xFE);
        }
    });
    let (mut board, probe) = board(MachineConfiguration::default(), Some(script));
    board.run_frame();
    assert!(probe.halt_pin.get());
    assert_eq!(board.bus().pic().request_register() & 0x01, 0x01);

    // A non-specific EOI clears every request.
    board.bus_mut().write_port(PIC_COMMAND_PORT, 0o40).unwrap();
    assert_eq!(board.bus().pic().request_register(), 0);

    // Fully masked: the request is recorded but the line stays low.
    let script: Script = Box::new(|step, bus| {
        if step == 1 {
            init_pic(bus, 0xFF);
        }
    });
    let (mut board, probe) = self::board(MachineConfiguration::default(), Some(script));
    board.run_frame();
    assert!(!probe.halt_pin.get());
    assert_eq!(board.bus().pic().request_register() & 0x01, 0x01);
}

#[test]
fn test_ram_round_trip_through_user_segments() {
    let mut bus = BusInterface::new(MachineConfiguration::default().ram.bytes(), false);
    let mut ur = [0u16; 8];
    for (i, d) in ur.iter_mut().enumerate() {
        *d = (i as u16 + 1) * 0x20;
    }
    bus.set_ur(ur);

    let pattern = |a: u16| a.wrapping_mul(31) ^ 0x5A5A;
    for address in (0..0o160000u16).step_by(2) {
        bus.write_word(address, false, pattern(address)).unwrap();
    }
    for address in (0..0o160000u16).step_by(2) {
        assert_eq!(bus.read_word(address, false, false), Ok(pattern(address)));
    }
    // Segment 0 is backed by the second 8K page.
    assert_eq!(&bus.ram()[0x2000..0x2002], &pattern(0).to_le_bytes());
}

struct SampleCounter(Rc<Cell<u32>>);

impl SoundDevice for SampleCounter {
    fn sample(&mut self, _dac: u8, _speaker: bool) {
        self.0.set(self.0.get() + 1);
    }
}

#[test]
fn test_sound_hook_interval() {
    assert_eq!(sound_interval(22050), 22);
    assert_eq!(sound_interval(10), 20000);

    let samples = Rc::new(Cell::new(0));
    let (mut board, _) = board(MachineConfiguration::default(), None);
    board.set_sound_device(Box::new(SampleCounter(samples.clone())));
    board.run_frame();
    assert_eq!(samples.get(), (FRAME_TICKS - 1) / 22 + 1);
}

struct SerialCapture(Rc<RefCell<Vec<u8>>>);

impl SerialDevice for SerialCapture {
    fn transmit(&mut self, byte: u8) {
        self.0.borrow_mut().push(byte);
    }
}

#[test]
fn test_keyboard_and_serial_endpoints() {
    let script: Script = Box::new(|step, bus| {
        if step <= 3 {
            bus.write_word(SERIAL_DATA_PORT, true, b"NEO"[step as usize - 1] as u16).unwrap();
        }
    });
    let (mut board, _) = board(MachineConfiguration::default(), Some(script));
    let sent = Rc::new(RefCell::new(Vec::new()));
    board.attach_serial_device(Box::new(SerialCapture(sent.clone())));
    board.run_frame();
    assert_eq!(&sent.borrow()[..], b"NEO");

    board.key_event(0x1C);
    assert_eq!(board.bus_mut().read_port(KEYBOARD_DATA_PORT), Ok(0x1C));
}

#[test]
fn test_virq_reaches_processor() {
    let (mut board, probe) = board(MachineConfiguration::default(), None);
    board.raise_virq(4, 0o60);
    assert_eq!(&probe.virqs.borrow()[..], &[(4, 0o60)]);
}

#[test]
fn test_floppy_read_through_board() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..4 * TRACK_IMAGE_BYTES).map(|i| (i * 3 + i / 7) as u8).collect();
    file.write_all(&data).unwrap();

    let config = MachineConfiguration {
        floppy_controller: true,
        floppy: vec![file.path().to_path_buf()],
        ..Default::default()
    };

    // Poll the controller the way a non-DMA driver does: take a word whenever the data
    // request is raised during execution.
    let words = Rc::new(RefCell::new(Vec::new()));
    let sink = words.clone();
    let script: Script = Box::new(move |step, bus| {
        if step == 1 {
            init_pic(bus, 0x00);
            for b in [0x46, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x1B, 0xFF] {
                bus.write_word(FDC_DATA_PORT, true, b).unwrap();
            }
            return;
        }
        let msr = bus.read_word(FDC_STATUS_PORT, true, false).unwrap();
        if msr & 0xE0 == 0xE0 {
            sink.borrow_mut().push(bus.read_word(FDC_DATA_PORT, true, false).unwrap());
        }
    });
    let (mut board, probe) = board(config, Some(script));

    for _ in 0..4 {
        board.run_frame();
        let phase = board.bus().fdc().as_ref().map(|fdc| fdc.phase());
        if phase == Some(ControllerPhase::Result) {
            break;
        }
    }
    assert_eq!(
        board.bus().fdc().as_ref().map(|fdc| fdc.phase()),
        Some(ControllerPhase::Result)
    );
    assert_eq!(board.bus().pic().request_register() & (1 << 5), 1 << 5);
    assert!(probe.halt_pin.get());

    let bytes: Vec<u8> = words.borrow().iter().flat_map(|w| w.to_le_bytes()).collect();
    assert_eq!(&bytes[..], &data[..SECTOR_SIZE]);

    let results: Vec<u16> = (0..7)
        .map(|_| board.bus_mut().read_port(FDC_DATA_PORT).unwrap())
        .collect();
    assert_eq!(results, vec![0, 0, 0, 1, 0, 1, 2]);
}

#[test]
fn test_floppy_ports_absent_without_controller() {
    let (mut board, _) = board(MachineConfiguration::default(), None);
    assert!(board.bus_mut().read_port(FDC_STATUS_PORT).is_err());
    assert!(board.attach_floppy(0, std::path::Path::new("a.img")).is_err());
}

#[test]
fn test_hard_disk_read_through_board() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..16 * 63 * 512).map(|i| (i / 512) as u8 ^ (i as u8)).collect();
    file.write_all(&data).unwrap();

    let config = MachineConfiguration {
        hard_drive: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    let port = |reg: u16| IDE_BASE_PORT + reg * 2;

    let words = Rc::new(RefCell::new(Vec::new()));
    let sink = words.clone();
    let script: Script = Box::new(move |step, bus| {
        if step == 1 {
            bus.write_word(port(IDE_REG_SECTOR_COUNT), true, 2).unwrap();
            bus.write_word(port(IDE_REG_DRIVE_HEAD), true, 0xE0).unwrap();
            bus.write_word(port(IDE_REG_STATUS), true, 0x20).unwrap();
            return;
        }
        let status = bus.read_word(port(IDE_REG_STATUS), true, false).unwrap();
        if status & 0x88 == 0x08 {
            sink.borrow_mut().push(bus.read_word(port(IDE_REG_DATA), true, false).unwrap());
        }
    });
    let (mut board, _) = board(config, Some(script));
    board.run_frame();

    let bytes: Vec<u8> = words.borrow().iter().flat_map(|w| w.to_le_bytes()).collect();
    assert_eq!(bytes.len(), 2 * 512);
    assert_eq!(&bytes[..], &data[..2 * 512]);
    assert_eq!(board.bus().ata().geometry().map(|g| g.total_sectors()), Some(16 * 63));
}

#[test]
fn test_read_only_media_through_board() {
    let mut hdd = tempfile::NamedTempFile::new().unwrap();
    hdd.write_all(&vec![0u8; 16 * 63 * 512]).unwrap();
    let mut floppy = tempfile::NamedTempFile::new().unwrap();
    floppy.write_all(&vec![0u8; 2 * TRACK_IMAGE_BYTES]).unwrap();

    let config = MachineConfiguration {
        floppy_controller: true,
        ..Default::default()
    };
    let (mut board, _) = board(config, None);
    board.attach_hard_drive_read_only(hdd.path()).unwrap();
    board.attach_floppy_read_only(0, floppy.path()).unwrap();

    let port = |reg: u16| IDE_BASE_PORT + reg * 2;
    let bus = board.bus_mut();
    bus.write_port(port(IDE_REG_STATUS), 0x30).unwrap();
    assert_eq!(bus.read_port(port(IDE_REG_STATUS)).unwrap() & 0x01, 0x01);
    assert_eq!(bus.read_port(port(IDE_REG_ERROR)).unwrap(), 0x04);

    // Sense drive status reports the write protect line.
    bus.write_port(FDC_DATA_PORT, 0x04).unwrap();
    bus.write_port(FDC_DATA_PORT, 0x00).unwrap();
    assert_eq!(bus.read_port(FDC_DATA_PORT).unwrap() & 0x40, 0x40);
}

#[test]
fn test_snapshot_restore() {
    let script: Script = Box::new(|step, bus| {
        if step == 1 {
            bus.write_word(0o2000, false, 0o777).unwrap();
            bus.write_word(0o161200, true, 0o40).unwrap();
        }
    });
    let (mut board, _) = board(MachineConfiguration::default(), Some(script));
    board.load_rom(&[0o12, 0o34]).unwrap();
    board.run_frame();

    let snapshot = board.save_state();
    let json = snapshot.to_json().unwrap();

    let (mut restored, _) = self::board(MachineConfiguration::default(), None);
    let snapshot = neon_core::snapshot::MachineSnapshot::from_json(&json).unwrap();
    restored.load_state(&snapshot).unwrap();
    assert_eq!(restored.peek_word(0o2000, false), Some(0o777));
    assert_eq!(restored.hr()[0], 0o40);
    assert_eq!(restored.peek_word(0, true), Some(0o34 << 8 | 0o12));

    let config = MachineConfiguration::from_bits(0x0001);
    let (mut other, _) = self::board(config, None);
    assert!(other.load_state(&snapshot).is_err());
}

#[test]
fn test_snapshot_with_missing_timer_channel_is_rejected() {
    let (board, _) = board(MachineConfiguration::default(), None);
    let mut value: serde_json::Value = serde_json::from_str(&board.save_state().to_json().unwrap()).unwrap();
    let channels = value["pit"]["channels"].as_array_mut().unwrap();
    assert_eq!(channels.len(), 3);
    channels.truncate(2);

    assert!(neon_core::snapshot::MachineSnapshot::from_json(&value.to_string()).is_err());
}
