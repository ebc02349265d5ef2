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

    cpu_common.rs

    Defines the Processor trait. The instruction execution engine lives
    outside of this crate; the Motherboard drives it one micro-step at a
    time and signals bus conditions back to it through this interface.

*/

use crate::bus::CpuBus;

/// Register index of the program counter in the processor's visible register file.
pub const REGISTER_PC: usize = 7;
/// Register index of the stack pointer in the processor's visible register file.
pub const REGISTER_SP: usize = 6;

/// The instruction execution engine, as seen by the board.
///
/// Memory accesses made during [Processor::execute] go through the provided [CpuBus]. A
/// [crate::bus::BusError] returned to the processor aborts that access only; the trap itself is
/// delivered by the board through [Processor::memory_error] once the micro-step returns.
pub trait Processor {
    /// Run one micro-step. An instruction may take several micro-steps to complete.
    fn execute(&mut self, bus: &mut dyn CpuBus);

    /// Reset the processor to its power-on state.
    fn reset(&mut self);

    /// Return the current program counter.
    fn pc(&self) -> u16 {
        self.reg(REGISTER_PC)
    }

    fn reg(&self, reg: usize) -> u16;
    fn set_reg(&mut self, reg: usize, value: u16);

    /// Return true if the processor is executing in HALT mode.
    fn is_halt_mode(&self) -> bool;

    /// Drive the processor's HALT request pin. The board asserts it while the interrupt
    /// controller has an unmasked request pending.
    fn set_halt_pin(&mut self, state: bool);

    /// Signal a bus error raised during the last micro-step.
    fn memory_error(&mut self);

    /// Raise a vectored interrupt request at the given priority level.
    fn interrupt_virq(&mut self, level: u8, vector: u16);

    /// Return the processor's micro-step position within the current instruction.
    /// Zero means the processor is at an instruction boundary.
    fn internal_tick(&self) -> u16;
    fn clear_internal_tick(&mut self);
}
