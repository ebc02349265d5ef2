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

    benches::frame_bench.rs

    Benchmarks for the frame scheduler

*/

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use neon_core::{
    bus::CpuBus,
    cpu_common::{Processor, REGISTER_PC},
    machine_config::MachineConfiguration,
    machine_types::MachineType,
    Motherboard,
};

/// Fetches one word per micro-step and otherwise does nothing.
#[derive(Default)]
struct IdleCpu {
    regs: [u16; 8],
}

impl Processor for IdleCpu {
    fn execute(&mut self, bus: &mut dyn CpuBus) {
        let pc = self.regs[REGISTER_PC];
        let _ = bus.read_word(pc, false, true);
        self.regs[REGISTER_PC] = pc.wrapping_add(2) & 0o17777;
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
        false
    }

    fn set_halt_pin(&mut self, _state: bool) {}

    fn memory_error(&mut self) {}

    fn interrupt_virq(&mut self, _level: u8, _vector: u16) {}

    fn internal_tick(&self) -> u16 {
        0
    }

    fn clear_internal_tick(&mut self) {}
}

pub fn frame_bench(c: &mut Criterion) {
    let config = MachineConfiguration {
        floppy_controller: true,
        ..Default::default()
    };
    let mut board = Motherboard::new(config, Box::new(IdleCpu::default())).unwrap();

    c.bench_function("frame_bench", |b| {
        b.iter(|| {
            black_box(board.run_frame());
        });
    });
}

pub fn frame_bench_turbo(c: &mut Criterion) {
    let config = MachineConfiguration {
        machine_type: MachineType::Pk11_16Turbo,
        floppy_controller: true,
        ..Default::default()
    };
    let mut board = Motherboard::new(config, Box::new(IdleCpu::default())).unwrap();

    c.bench_function("frame_bench_turbo", |b| {
        b.iter(|| {
            black_box(board.run_frame());
        });
    });
}

criterion_group!(benches, frame_bench, frame_bench_turbo);
criterion_main!(benches);
