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

    devices::pic.rs

    Implements the 8259-style PIC (Programmable Interrupt Controller).

    The board only uses the controller in single, edge-triggered mode with
    the processor polling for the active request, so the controller is a
    two-word initialization handshake, a request register, a mask register
    and a poll command.

*/

use serde::{Deserialize, Serialize};

use crate::bus::IoDevice;

pub const PIC_COMMAND_PORT: u16 = 0o161000;
pub const PIC_MASK_PORT: u16 = 0o161002;

const ICW1_IS_ICW1: u8 = 0b0001_0000; // Bit determines if input is ICW1
const ICW2_MASK: u8 = 0b1111_1000; // Bit mask for ICW2 vector base

const OCW_IS_OCW3: u8 = 0b0000_1000; // Bit on if OCW is OCW3
const OCW2_EOI: u8 = 0b0010_0000;
const OCW2_SPECIFIC: u8 = 0b0100_0000;
const OCW3_POLL_COMMAND: u8 = 0b0000_0100;

const POLL_REQUEST_BIT: u16 = 0x80;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PicMode {
    #[default]
    AwaitingIcw1,
    AwaitingIcw2,
    Ready,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pic {
    mode: PicMode,
    poll: bool,    // Poll command issued, next command port read returns the poll word
    vector_base: u8,
    rr: u8,        // Interrupt Request Register
    mask: u8,      // Interrupt Mask Register
    intr: bool,    // INT request line of PIC
}

impl Default for Pic {
    fn default() -> Self {
        Self {
            mode: PicMode::AwaitingIcw1,
            poll: false,
            vector_base: 0,
            rr: 0,
            mask: 0xFF, // All inputs initially masked
            intr: false,
        }
    }
}

impl IoDevice for Pic {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            PIC_COMMAND_PORT => self.handle_command_register_read(),
            PIC_MASK_PORT => self.mask as u16,
            _ => unreachable!("PIC: Bad port #"),
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            PIC_COMMAND_PORT => self.handle_command_register_write(data as u8),
            PIC_MASK_PORT => self.handle_mask_register_write(data as u8),
            _ => unreachable!("PIC: Bad port #"),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            PIC_COMMAND_PORT if self.poll => Some(self.poll_word()),
            PIC_COMMAND_PORT => Some(self.rr as u16),
            PIC_MASK_PORT => Some(self.mask as u16),
            _ => None,
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("PIC Command Port"), PIC_COMMAND_PORT),
            (String::from("PIC Mask Port"), PIC_MASK_PORT),
        ]
    }
}

impl Pic {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    pub fn mode(&self) -> PicMode {
        self.mode
    }

    pub fn request_register(&self) -> u8 {
        self.rr
    }

    pub fn mask_register(&self) -> u8 {
        self.mask
    }

    pub fn vector_base(&self) -> u8 {
        self.vector_base
    }

    /// Return the state of the INT request line.
    #[inline]
    pub fn intr(&self) -> bool {
        self.intr
    }

    pub fn handle_command_register_write(&mut self, byte: u8) {
        if byte & ICW1_IS_ICW1 != 0 {
            log::debug!("PIC: Read ICW1: {:03o}", byte);
            self.mode = PicMode::AwaitingIcw2;
            self.rr = 0;
            self.mask = 0;
            self.poll = false;
            self.intr = false;
            return;
        }

        if self.mode != PicMode::Ready {
            log::warn!("PIC: Command {:03o} received during initialization", byte);
            return;
        }

        if byte & OCW_IS_OCW3 != 0 {
            if byte & OCW3_POLL_COMMAND != 0 {
                log::trace!("PIC: Poll command");
                self.poll = true;
            }
        }
        else if byte & OCW2_EOI != 0 {
            if byte & OCW2_SPECIFIC != 0 {
                self.eoi(Some(byte & 0x07));
            }
            else {
                self.eoi(None);
            }
        }
        else {
            log::trace!("PIC: Unhandled command: {:03o}", byte)
        }
    }

    /// Perform an EOI (End of interrupt).
    /// A non-specific EOI clears every pending request. A specific EOI clears one request line.
    pub fn eoi(&mut self, line: Option<u8>) {
        match line {
            Some(ir) => self.rr &= !(1 << ir),
            None => self.rr = 0,
        }
        self.intr = self.calc_intr().is_some();
    }

    pub fn handle_mask_register_write(&mut self, byte: u8) {
        match self.mode {
            PicMode::AwaitingIcw2 => {
                log::debug!("PIC: Read ICW2: {:03o}", byte);
                self.vector_base = byte & ICW2_MASK;
                self.mode = PicMode::Ready;
            }
            _ => {
                log::trace!("PIC: Set mask to: {:03o}", byte);
                self.set_mask(byte);
            }
        }
    }

    /// Set the value of the mask register.
    /// Unmasking a pending request raises INTR; masking every pending request lowers it.
    fn set_mask(&mut self, byte: u8) {
        self.mask = byte;
        self.intr = self.calc_intr().is_some();
    }

    /// Return the lowest numbered request that is pending and not masked.
    fn calc_intr(&self) -> Option<u8> {
        let pending = self.rr & !self.mask;
        (pending != 0).then(|| pending.trailing_zeros() as u8)
    }

    fn poll_word(&self) -> u16 {
        match self.calc_intr() {
            Some(ir) => POLL_REQUEST_BIT | ir as u16,
            None => 0,
        }
    }

    pub fn handle_command_register_read(&mut self) -> u16 {
        if self.poll {
            self.poll = false;
            let word = self.poll_word();
            log::trace!("PIC: Poll read: {:03o}", word);
            word
        }
        else {
            self.rr as u16
        }
    }

    /// Called by a device to request interrupt service. Has no effect until the controller has
    /// completed its initialization sequence.
    pub fn set_signal(&mut self, signal: u8) {
        if self.mode != PicMode::Ready {
            return;
        }
        let bit = 1 << signal;
        if self.rr & bit == 0 {
            self.rr |= bit;
            if self.mask & bit == 0 {
                self.intr = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_pic() -> Pic {
        let mut pic = Pic::new();
        pic.write_u16(PIC_COMMAND_PORT, 0o23);
        pic.write_u16(PIC_MASK_PORT, 0o100);
        assert_eq!(pic.mode(), PicMode::Ready);
        pic
    }

    #[test]
    fn test_signals_ignored_during_initialization() {
        let mut pic = Pic::new();
        pic.set_signal(2);
        assert_eq!(pic.request_register(), 0);

        pic.write_u16(PIC_COMMAND_PORT, 0o23);
        pic.set_signal(2);
        assert_eq!(pic.request_register(), 0);
        assert!(!pic.intr());
    }

    #[test]
    fn test_eoi_clears_requests() {
        let mut pic = ready_pic();
        pic.set_signal(3);
        pic.set_signal(5);
        assert!(pic.intr());
        assert_eq!(pic.read_u16(PIC_COMMAND_PORT), 0b0010_1000);

        pic.write_u16(PIC_COMMAND_PORT, 0o40);
        assert_eq!(pic.request_register(), 0);
        assert!(!pic.intr());
    }

    #[test]
    fn test_specific_eoi() {
        let mut pic = ready_pic();
        pic.set_signal(1);
        pic.set_signal(4);
        pic.write_u16(PIC_COMMAND_PORT, 0o141);
        assert_eq!(pic.request_register(), 0b0001_0000);
        assert!(pic.intr());
    }

    #[test]
    fn test_masked_signal_never_raises_intr() {
        let mut pic = ready_pic();
        pic.write_u16(PIC_MASK_PORT, 0b0000_1000);
        pic.set_signal(3);
        assert!(!pic.intr());
        assert_eq!(pic.request_register(), 0b0000_1000);

        // Unmasking the pending request raises the line.
        pic.write_u16(PIC_MASK_PORT, 0);
        assert!(pic.intr());
    }

    #[test]
    fn test_poll_returns_lowest_unmasked_request() {
        let mut pic = ready_pic();
        pic.write_u16(PIC_MASK_PORT, 0b0000_0010);
        pic.set_signal(1);
        pic.set_signal(6);
        pic.write_u16(PIC_COMMAND_PORT, 0o14);
        assert_eq!(pic.peek_u16(PIC_COMMAND_PORT), Some(0x86));
        assert_eq!(pic.read_u16(PIC_COMMAND_PORT), 0x86);
        // The poll is one-shot.
        assert_eq!(pic.read_u16(PIC_COMMAND_PORT), 0b0100_0010);

        pic.write_u16(PIC_COMMAND_PORT, 0o40);
        pic.write_u16(PIC_COMMAND_PORT, 0o14);
        assert_eq!(pic.read_u16(PIC_COMMAND_PORT), 0);
    }
}
