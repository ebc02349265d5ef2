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

    devices::serial.rs

    Implements the serial port. Transmitted bytes are handed to an
    attached SerialDevice immediately; received bytes are queued by the
    host and raise an interrupt request when they become available.

*/

use std::collections::VecDeque;

use modular_bitfield::{bitfield, prelude::*};

use crate::{bus::IoDevice, device_traits::serialdevice::SerialDevice};

pub const SERIAL_DATA_PORT: u16 = 0o161040;
pub const SERIAL_STATUS_PORT: u16 = 0o161042;

const SERIAL_RX_BUFFER_LEN: usize = 16;

#[bitfield]
#[derive(Copy, Clone)]
pub struct SerialStatus {
    #[skip]
    unused: B5,
    pub tx_ready: bool,
    pub overrun: bool,
    pub rx_ready: bool,
}

pub struct SerialPort {
    device: Option<Box<dyn SerialDevice>>,
    rx_buffer: VecDeque<u8>,
    status: SerialStatus,
    send_interrupt: bool,
}

impl Default for SerialPort {
    fn default() -> Self {
        Self {
            device: None,
            rx_buffer: VecDeque::with_capacity(SERIAL_RX_BUFFER_LEN),
            status: SerialStatus::new().with_tx_ready(true),
            send_interrupt: false,
        }
    }
}

impl IoDevice for SerialPort {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            SERIAL_DATA_PORT => self.data_register_read() as u16,
            _ => self.status.into_bytes()[0] as u16,
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            SERIAL_DATA_PORT => self.data_register_write(data as u8),
            _ => {
                log::trace!("Serial: Status register write: {:03o}", data);
                self.status.set_overrun(false);
            }
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            SERIAL_DATA_PORT => Some(self.rx_buffer.front().copied().unwrap_or(0) as u16),
            _ => Some(self.status.into_bytes()[0] as u16),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("Serial Data"), SERIAL_DATA_PORT),
            (String::from("Serial Status"), SERIAL_STATUS_PORT),
        ]
    }
}

impl SerialPort {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reset the port. An attached device stays attached.
    pub fn reset(&mut self) {
        self.rx_buffer.clear();
        self.status = SerialStatus::new().with_tx_ready(true);
        self.send_interrupt = false;
    }

    pub fn attach(&mut self, device: Box<dyn SerialDevice>) {
        self.device = Some(device);
    }

    pub fn detach(&mut self) -> Option<Box<dyn SerialDevice>> {
        self.device.take()
    }

    /// Queue a byte received from the host side of the line.
    pub fn receive(&mut self, byte: u8) {
        if self.rx_buffer.len() >= SERIAL_RX_BUFFER_LEN {
            log::warn!("Serial: Receive buffer overrun, dropping {:02X}", byte);
            self.status.set_overrun(true);
            return;
        }
        self.rx_buffer.push_back(byte);
        if !self.status.rx_ready() {
            self.status.set_rx_ready(true);
            self.send_interrupt = true;
        }
    }

    pub fn data_register_read(&mut self) -> u8 {
        let byte = self.rx_buffer.pop_front().unwrap_or(0);
        self.status.set_rx_ready(!self.rx_buffer.is_empty());
        if self.status.rx_ready() {
            self.send_interrupt = true;
        }
        byte
    }

    pub fn data_register_write(&mut self, byte: u8) {
        log::trace!("Serial: Transmit {:02X}", byte);
        if let Some(device) = &mut self.device {
            device.transmit(byte);
        }
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_overrun() {
        let mut port = SerialPort::new();
        for byte in 0..SERIAL_RX_BUFFER_LEN as u8 + 2 {
            port.receive(byte);
        }
        assert!(port.take_interrupt());
        assert_eq!(port.read_u16(SERIAL_STATUS_PORT) & 0xC0, 0xC0);

        for byte in 0..SERIAL_RX_BUFFER_LEN as u16 {
            assert_eq!(port.read_u16(SERIAL_DATA_PORT), byte);
        }
        assert_eq!(port.read_u16(SERIAL_STATUS_PORT) & 0x80, 0);

        // Writing the status register clears the overrun flag.
        port.write_u16(SERIAL_STATUS_PORT, 0);
        assert_eq!(port.read_u16(SERIAL_STATUS_PORT) & 0x40, 0);
    }
}
