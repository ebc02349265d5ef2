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

    devices::keyboard.rs

    Implements the keyboard interface. The host enqueues scan codes; the
    guest pops them one at a time from the data register.

*/

use std::collections::VecDeque;

use modular_bitfield::{bitfield, prelude::*};

use crate::bus::IoDevice;

pub const KEYBOARD_DATA_PORT: u16 = 0o161020;
pub const KEYBOARD_STATUS_PORT: u16 = 0o161022;

const KEYBOARD_BUFFER_LEN: usize = 16;

#[bitfield]
#[derive(Copy, Clone, Default)]
pub struct KeyboardStatus {
    #[skip]
    unused: B6,
    pub overrun: bool,
    pub ready: bool,
}

#[derive(Default)]
pub struct Keyboard {
    buffer: VecDeque<u8>,
    status: KeyboardStatus,
    send_interrupt: bool,
}

impl IoDevice for Keyboard {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            KEYBOARD_DATA_PORT => self.data_register_read() as u16,
            _ => self.status.into_bytes()[0] as u16,
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            KEYBOARD_STATUS_PORT => {
                // Writing the status register clears the overrun flag.
                log::trace!("Keyboard: Status register write: {:03o}", data);
                self.status.set_overrun(false);
            }
            _ => log::warn!("Keyboard: Write to read-only data register: {:03o}", data),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            KEYBOARD_DATA_PORT => Some(self.buffer.front().copied().unwrap_or(0) as u16),
            _ => Some(self.status.into_bytes()[0] as u16),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("Keyboard Data"), KEYBOARD_DATA_PORT),
            (String::from("Keyboard Status"), KEYBOARD_STATUS_PORT),
        ]
    }
}

impl Keyboard {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Enqueue a scan code from the host. Codes arriving with a full buffer are dropped and set
    /// the overrun flag.
    pub fn push_scancode(&mut self, code: u8) {
        if self.buffer.len() >= KEYBOARD_BUFFER_LEN {
            log::warn!("Keyboard: Buffer overrun, dropping scancode {:02X}", code);
            self.status.set_overrun(true);
            return;
        }
        self.buffer.push_back(code);
        if !self.status.ready() {
            self.status.set_ready(true);
            self.send_interrupt = true;
        }
    }

    pub fn data_register_read(&mut self) -> u8 {
        let code = self.buffer.pop_front().unwrap_or(0);
        self.status.set_ready(false);
        if !self.buffer.is_empty() {
            // The next code becomes ready and requests service again.
            self.status.set_ready(true);
            self.send_interrupt = true;
        }
        code
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scancode_queue() {
        let mut kb = Keyboard::new();
        assert_eq!(kb.read_u16(KEYBOARD_STATUS_PORT) & 0x80, 0);

        kb.push_scancode(0x1C);
        kb.push_scancode(0x32);
        assert!(kb.take_interrupt());
        assert_eq!(kb.read_u16(KEYBOARD_STATUS_PORT) & 0x80, 0x80);

        assert_eq!(kb.read_u16(KEYBOARD_DATA_PORT), 0x1C);
        assert!(kb.take_interrupt());
        assert_eq!(kb.read_u16(KEYBOARD_DATA_PORT), 0x32);
        assert!(!kb.take_interrupt());
        assert_eq!(kb.read_u16(KEYBOARD_STATUS_PORT) & 0x80, 0);
    }
}
