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

    devices::lpt_port.rs

    Implementation of a basic printer port. Bytes written to the data
    register are handed to an attached ParallelDevice; the port reports
    ready only while a device is attached and accepted the last byte.

*/

use modular_bitfield::{bitfield, prelude::*};

use crate::{bus::IoDevice, device_traits::serialdevice::ParallelDevice};

pub const LPT_DATA_PORT: u16 = 0o161030;
pub const LPT_STATUS_PORT: u16 = 0o161032;

#[bitfield]
#[derive(Copy, Clone, Default)]
pub struct ParallelStatus {
    #[skip]
    unused: B6,
    pub error: bool,
    pub ready: bool,
}

#[derive(Default)]
pub struct ParallelPort {
    device: Option<Box<dyn ParallelDevice>>,
    data: u8,
    status: ParallelStatus,
    send_interrupt: bool,
}

impl IoDevice for ParallelPort {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            LPT_DATA_PORT => self.data as u16,
            _ => self.status_register_read() as u16,
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            LPT_DATA_PORT => self.data_register_write(data as u8),
            _ => log::warn!("LPT: Write to read-only status register: {:03o}", data),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            LPT_DATA_PORT => Some(self.data as u16),
            _ => Some(self.status.into_bytes()[0] as u16),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("LPT Data"), LPT_DATA_PORT),
            (String::from("LPT Status"), LPT_STATUS_PORT),
        ]
    }
}

impl ParallelPort {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reset the port. An attached device stays attached.
    pub fn reset(&mut self) {
        self.data = 0;
        self.status = ParallelStatus::new().with_ready(self.device.is_some());
        self.send_interrupt = false;
    }

    pub fn attach(&mut self, device: Box<dyn ParallelDevice>) {
        self.device = Some(device);
        self.status.set_ready(true);
        self.status.set_error(false);
    }

    pub fn detach(&mut self) -> Option<Box<dyn ParallelDevice>> {
        self.status.set_ready(false);
        self.device.take()
    }

    pub fn status_register_read(&mut self) -> u8 {
        let byte = self.status.into_bytes()[0];
        log::trace!("LPT: Status register read: {:02X}", byte);
        byte
    }

    pub fn data_register_write(&mut self, data: u8) {
        self.data = data;
        log::trace!("LPT: Data register write: {:#02X}", data);

        let accepted = match &mut self.device {
            Some(device) => device.write(data),
            None => false,
        };
        self.status.set_ready(accepted);
        self.status.set_error(!accepted);
        if accepted {
            self.send_interrupt = true;
        }
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    struct Printer(Rc<RefCell<Vec<u8>>>);

    impl ParallelDevice for Printer {
        fn write(&mut self, byte: u8) -> bool {
            self.0.borrow_mut().push(byte);
            true
        }
    }

    #[test]
    fn test_ready_requires_device() {
        let mut lpt = ParallelPort::new();
        lpt.write_u16(LPT_DATA_PORT, 0x41);
        assert_eq!(lpt.read_u16(LPT_STATUS_PORT) & 0x80, 0);
        assert!(!lpt.take_interrupt());

        let printed = Rc::new(RefCell::new(Vec::new()));
        lpt.attach(Box::new(Printer(printed.clone())));
        lpt.write_u16(LPT_DATA_PORT, 0x42);
        assert_eq!(lpt.read_u16(LPT_STATUS_PORT) & 0x80, 0x80);
        assert!(lpt.take_interrupt());
        assert_eq!(*printed.borrow(), vec![0x42]);
    }
}
