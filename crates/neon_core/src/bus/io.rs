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

    bus::io.rs

    Port dispatch for the I/O window. Every port claimed by a device is
    listed in the bus io_map; a port that is not in the map faults.

*/

use crate::bus::{BusError, BusInterface, IoDevice, IoDeviceType, SEGMENT_COUNT};

pub const HR_BASE_PORT: u16 = 0o161200;
pub const UR_BASE_PORT: u16 = 0o161220;
pub const SOUND_PORT: u16 = 0o161070;

/// Bit of the sound register that drives the gate input of timer channel 2.
pub const SOUND_GATE_BIT: u16 = 0x0100;

#[inline]
fn segment_index(port: u16, base: u16) -> usize {
    (((port - base) >> 1) as usize) & (SEGMENT_COUNT - 1)
}

impl BusInterface {
    /// Read a 16-bit register from the I/O window.
    pub fn read_port(&mut self, port: u16) -> Result<u16, BusError> {
        let Some(device_id) = self.io_map.get(&port).copied() else {
            log::warn!("Read from unmapped port {:06o}", port);
            return Err(BusError::UnmappedPort(port));
        };

        let data = match device_id {
            IoDeviceType::Pic => self.pic.read_u16(port),
            IoDeviceType::Pit => self.pit.read_u16(port),
            IoDeviceType::Keyboard => self.keyboard.read_u16(port),
            IoDeviceType::Parallel => self.parallel.read_u16(port),
            IoDeviceType::Serial => self.serial.read_u16(port),
            IoDeviceType::FloppyController => match &mut self.fdc {
                Some(fdc) => fdc.read_u16(port),
                None => return Err(BusError::UnmappedPort(port)),
            },
            IoDeviceType::Sound => self.sound_register,
            IoDeviceType::HaltSegments => self.hr[segment_index(port, HR_BASE_PORT)],
            IoDeviceType::UserSegments => self.ur[segment_index(port, UR_BASE_PORT)],
            IoDeviceType::Rtc => self.rtc.read_u16(port),
            IoDeviceType::HardDiskController => self.ata.read_u16(port),
        };
        log::trace!("Port read {:06o} -> {:06o}", port, data);
        Ok(data)
    }

    /// Write a 16-bit register in the I/O window. Segment descriptor writes take effect on the
    /// next memory access.
    pub fn write_port(&mut self, port: u16, data: u16) -> Result<(), BusError> {
        let Some(device_id) = self.io_map.get(&port).copied() else {
            log::warn!("Write to unmapped port {:06o}: {:06o}", port, data);
            return Err(BusError::UnmappedPort(port));
        };
        log::trace!("Port write {:06o} <- {:06o}", port, data);

        match device_id {
            IoDeviceType::Pic => self.pic.write_u16(port, data),
            IoDeviceType::Pit => self.pit.write_u16(port, data),
            IoDeviceType::Keyboard => self.keyboard.write_u16(port, data),
            IoDeviceType::Parallel => self.parallel.write_u16(port, data),
            IoDeviceType::Serial => self.serial.write_u16(port, data),
            IoDeviceType::FloppyController => match &mut self.fdc {
                Some(fdc) => fdc.write_u16(port, data),
                None => return Err(BusError::UnmappedPort(port)),
            },
            IoDeviceType::Sound => {
                self.sound_register = data;
                self.pit.set_gate(2, data & SOUND_GATE_BIT != 0);
            }
            IoDeviceType::HaltSegments => {
                let n = segment_index(port, HR_BASE_PORT);
                log::debug!("HR{} <- {:06o}", n, data);
                self.hr[n] = data;
            }
            IoDeviceType::UserSegments => {
                let n = segment_index(port, UR_BASE_PORT);
                log::debug!("UR{} <- {:06o}", n, data);
                self.ur[n] = data;
            }
            IoDeviceType::Rtc => self.rtc.write_u16(port, data),
            IoDeviceType::HardDiskController => self.ata.write_u16(port, data),
        }

        self.service_interrupts();
        Ok(())
    }

    /// Return the value of an I/O register without side effects, if the register can be peeked.
    pub fn peek_port(&self, port: u16) -> Option<u16> {
        match self.io_map.get(&port)? {
            IoDeviceType::Pic => self.pic.peek_u16(port),
            IoDeviceType::Pit => self.pit.peek_u16(port),
            IoDeviceType::Keyboard => self.keyboard.peek_u16(port),
            IoDeviceType::Parallel => self.parallel.peek_u16(port),
            IoDeviceType::Serial => self.serial.peek_u16(port),
            IoDeviceType::FloppyController => self.fdc.as_ref()?.peek_u16(port),
            IoDeviceType::Sound => Some(self.sound_register),
            IoDeviceType::HaltSegments => Some(self.hr[segment_index(port, HR_BASE_PORT)]),
            IoDeviceType::UserSegments => Some(self.ur[segment_index(port, UR_BASE_PORT)]),
            IoDeviceType::Rtc => self.rtc.peek_u16(port),
            IoDeviceType::HardDiskController => self.ata.peek_u16(port),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{BusError, BusInterface, CpuBus, MemoryKind};

    use super::*;

    #[test]
    fn test_segment_registers_take_effect_immediately() {
        let mut bus = BusInterface::new(512 * 1024, false);
        bus.write_port(UR_BASE_PORT + 2, 0x0020).unwrap();
        assert_eq!(bus.ur()[1], 0x0020);
        assert_eq!(bus.translate(0o20000, false, false), (MemoryKind::Ram, 0x2000));

        bus.write_port(UR_BASE_PORT + 2, 0x0021).unwrap();
        assert_eq!(bus.translate(0o20000, false, false).0, MemoryKind::Deny);
        assert_eq!(bus.read_word(0o20000, false, false), Err(BusError::Denied(0o20000)));
    }

    #[test]
    fn test_unmapped_port_faults() {
        let mut bus = BusInterface::new(512 * 1024, false);
        assert_eq!(bus.read_port(0o160000), Err(BusError::UnmappedPort(0o160000)));
        assert_eq!(bus.write_word(0o160002, true, 0), Err(BusError::UnmappedPort(0o160002)));
        // Floppy ports are absent without a floppy controller.
        assert!(bus.read_port(0o161062).is_err());

        let mut bus = BusInterface::new(512 * 1024, true);
        assert!(bus.read_port(0o161062).is_ok());
    }

    #[test]
    fn test_byte_write_to_odd_port_address() {
        let mut bus = BusInterface::new(512 * 1024, false);
        bus.write_byte(HR_BASE_PORT + 1, true, 0x12).unwrap();
        assert_eq!(bus.hr()[0], 0x1200);
        assert_eq!(bus.read_byte(HR_BASE_PORT + 1, true), Ok(0x12));
        bus.write_byte(HR_BASE_PORT, true, 0x34).unwrap();
        assert_eq!(bus.hr()[0], 0x0034);
    }

    #[test]
    fn test_sound_register_drives_timer_gate() {
        let mut bus = BusInterface::new(512 * 1024, false);
        bus.write_port(SOUND_PORT, 0x0080).unwrap();
        assert!(!bus.pit().gate(2));
        assert_eq!(bus.sound_levels().0, 0x80);
        bus.write_port(SOUND_PORT, SOUND_GATE_BIT).unwrap();
        assert!(bus.pit().gate(2));
        assert_eq!(bus.peek_port(SOUND_PORT), Some(SOUND_GATE_BIT));
    }
}
