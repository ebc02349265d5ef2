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

    devices::rtc.rs

    Implements an MC146818-style real time clock register bank.

    The current time is never stored; every read of a time register is
    derived from the host's local clock. Only the alarm registers, the
    status registers and the NVRAM bytes persist.

*/

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::bus::IoDevice;

pub const RTC_BASE_PORT: u16 = 0o161400;
pub const RTC_REGISTER_COUNT: usize = 32;

pub const REG_SECONDS: usize = 0;
pub const REG_ALARM_SECONDS: usize = 1;
pub const REG_MINUTES: usize = 2;
pub const REG_ALARM_MINUTES: usize = 3;
pub const REG_HOURS: usize = 4;
pub const REG_ALARM_HOURS: usize = 5;
pub const REG_DAY_OF_WEEK: usize = 6;
pub const REG_DAY_OF_MONTH: usize = 7;
pub const REG_MONTH: usize = 8;
pub const REG_YEAR: usize = 9;
pub const REG_STATUS_A: usize = 10;
pub const REG_STATUS_B: usize = 11;
pub const REG_STATUS_C: usize = 12;
pub const REG_STATUS_D: usize = 13;
pub const NVRAM_START: usize = 14;

const STATUS_A_DEFAULT: u8 = 0x26;
const STATUS_B_24H: u8 = 0b0000_0010;
const STATUS_B_BINARY: u8 = 0b0000_0100;
const STATUS_B_ALARM_ENABLE: u8 = 0b0010_0000;
const STATUS_C_IRQF: u8 = 0b1000_0000;
const STATUS_C_ALARM: u8 = 0b0010_0000;
const STATUS_D_VALID: u8 = 0b1000_0000;
const HOUR_PM_BIT: u8 = 0b1000_0000;

/// Alarm register values at or above this match any value.
const ALARM_DONT_CARE: u8 = 0xC0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rtc {
    regs: [u8; RTC_REGISTER_COUNT],
    #[serde(skip)]
    last_alarm: Option<(u32, u32, u32)>,
    #[serde(skip)]
    send_interrupt: bool,
}

impl Default for Rtc {
    fn default() -> Self {
        let mut regs = [0; RTC_REGISTER_COUNT];
        regs[REG_STATUS_A] = STATUS_A_DEFAULT;
        regs[REG_STATUS_B] = STATUS_B_24H;
        regs[REG_STATUS_D] = STATUS_D_VALID;
        Self {
            regs,
            last_alarm: None,
            send_interrupt: false,
        }
    }
}

impl IoDevice for Rtc {
    fn read_u16(&mut self, port: u16) -> u16 {
        self.register_read(Self::port_register(port)) as u16
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        self.register_write(Self::port_register(port), data as u8);
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        Some(self.register_at(Self::port_register(port), &Local::now().naive_local()) as u16)
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        (0..RTC_REGISTER_COUNT as u16)
            .map(|n| (format!("RTC Register {n}"), RTC_BASE_PORT + n * 2))
            .collect()
    }
}

impl Rtc {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reset the status registers. NVRAM and alarm registers are battery backed and survive.
    pub fn reset(&mut self) {
        self.regs[REG_STATUS_A] = STATUS_A_DEFAULT;
        self.regs[REG_STATUS_B] = STATUS_B_24H;
        self.regs[REG_STATUS_C] = 0;
        self.regs[REG_STATUS_D] = STATUS_D_VALID;
        self.last_alarm = None;
        self.send_interrupt = false;
    }

    fn port_register(port: u16) -> usize {
        ((port - RTC_BASE_PORT) >> 1) as usize % RTC_REGISTER_COUNT
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.send_interrupt)
    }

    pub fn nvram(&self) -> &[u8] {
        &self.regs[NVRAM_START..]
    }

    fn binary_mode(&self) -> bool {
        self.regs[REG_STATUS_B] & STATUS_B_BINARY != 0
    }

    fn encode(&self, value: u32) -> u8 {
        let value = value as u8;
        if self.binary_mode() {
            value
        }
        else {
            ((value / 10) << 4) | (value % 10)
        }
    }

    fn encode_hours(&self, hour: u32) -> u8 {
        if self.regs[REG_STATUS_B] & STATUS_B_24H != 0 {
            return self.encode(hour);
        }
        let pm = if hour >= 12 { HOUR_PM_BIT } else { 0 };
        let hour12 = match hour % 12 {
            0 => 12,
            h => h,
        };
        self.encode(hour12) | pm
    }

    /// Return the value of a register at the given instant, without side effects.
    pub fn register_at(&self, reg: usize, now: &NaiveDateTime) -> u8 {
        match reg {
            REG_SECONDS => self.encode(now.second()),
            REG_MINUTES => self.encode(now.minute()),
            REG_HOURS => self.encode_hours(now.hour()),
            REG_DAY_OF_WEEK => self.encode(now.weekday().number_from_sunday()),
            REG_DAY_OF_MONTH => self.encode(now.day()),
            REG_MONTH => self.encode(now.month()),
            REG_YEAR => self.encode(now.year().rem_euclid(100) as u32),
            _ => self.regs[reg],
        }
    }

    pub fn register_read(&mut self, reg: usize) -> u8 {
        let byte = self.register_at(reg, &Local::now().naive_local());
        if reg == REG_STATUS_C {
            // Reading status register C acknowledges all pending flags.
            self.regs[REG_STATUS_C] = 0;
        }
        byte
    }

    pub fn register_write(&mut self, reg: usize, byte: u8) {
        match reg {
            REG_SECONDS | REG_MINUTES | REG_HOURS | REG_DAY_OF_WEEK | REG_DAY_OF_MONTH | REG_MONTH | REG_YEAR => {
                log::debug!("RTC: Ignoring write to time register {}: {:02X}", reg, byte);
            }
            REG_STATUS_C | REG_STATUS_D => {
                log::warn!("RTC: Write to read-only status register {}: {:02X}", reg, byte);
            }
            _ => self.regs[reg] = byte,
        }
    }

    fn alarm_field_matches(&self, reg: usize, value: u8) -> bool {
        let alarm = self.regs[reg];
        alarm >= ALARM_DONT_CARE || alarm == value
    }

    /// Compare the alarm registers against the host clock.
    pub fn check_alarm(&mut self) {
        self.check_alarm_at(&Local::now().naive_local());
    }

    /// Compare the alarm registers against the specified instant. The alarm fires at most once
    /// per matching second.
    pub fn check_alarm_at(&mut self, now: &NaiveDateTime) {
        let matched = self.alarm_field_matches(REG_ALARM_SECONDS, self.register_at(REG_SECONDS, now))
            && self.alarm_field_matches(REG_ALARM_MINUTES, self.register_at(REG_MINUTES, now))
            && self.alarm_field_matches(REG_ALARM_HOURS, self.register_at(REG_HOURS, now));
        if !matched {
            return;
        }

        let stamp = (now.hour(), now.minute(), now.second());
        if self.last_alarm == Some(stamp) {
            return;
        }
        self.last_alarm = Some(stamp);

        self.regs[REG_STATUS_C] |= STATUS_C_ALARM;
        if self.regs[REG_STATUS_B] & STATUS_B_ALARM_ENABLE != 0 {
            log::debug!("RTC: Alarm at {:02}:{:02}:{:02}", stamp.0, stamp.1, stamp.2);
            self.regs[REG_STATUS_C] |= STATUS_C_IRQF;
            self.send_interrupt = true;
        }
    }

    /// Restore the persistent register bank from a snapshot.
    pub fn restore(&mut self, other: Rtc) {
        self.regs = other.regs;
        self.last_alarm = None;
        self.send_interrupt = false;
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn instant(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 17)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .unwrap()
    }

    #[test]
    fn test_bcd_and_binary_time() {
        let mut rtc = Rtc::new();
        let now = instant(21, 45, 59);
        assert_eq!(rtc.register_at(REG_SECONDS, &now), 0x59);
        assert_eq!(rtc.register_at(REG_HOURS, &now), 0x21);
        assert_eq!(rtc.register_at(REG_YEAR, &now), 0x24);
        // 2024-03-17 was a Sunday.
        assert_eq!(rtc.register_at(REG_DAY_OF_WEEK, &now), 1);

        rtc.register_write(REG_STATUS_B, STATUS_B_24H | STATUS_B_BINARY);
        assert_eq!(rtc.register_at(REG_SECONDS, &now), 59);
        assert_eq!(rtc.register_at(REG_MONTH, &now), 3);

        rtc.register_write(REG_STATUS_B, 0);
        assert_eq!(rtc.register_at(REG_HOURS, &now), 0x09 | HOUR_PM_BIT);
        assert_eq!(rtc.register_at(REG_HOURS, &instant(0, 5, 0)), 0x12);
    }

    #[test]
    fn test_nvram_round_trip() {
        let mut rtc = Rtc::new();
        for reg in NVRAM_START..RTC_REGISTER_COUNT {
            rtc.write_u16(RTC_BASE_PORT + (reg as u16) * 2, reg as u16 ^ 0xA5);
        }
        for reg in NVRAM_START..RTC_REGISTER_COUNT {
            assert_eq!(rtc.read_u16(RTC_BASE_PORT + (reg as u16) * 2), (reg as u16 ^ 0xA5) & 0xFF);
        }
        assert_eq!(rtc.read_u16(RTC_BASE_PORT + 2 * REG_STATUS_D as u16), 0x80);
    }

    #[test]
    fn test_alarm_raises_once_and_status_c_clears() {
        let mut rtc = Rtc::new();
        rtc.register_write(REG_ALARM_HOURS, 0x07);
        rtc.register_write(REG_ALARM_MINUTES, 0x30);
        rtc.register_write(REG_ALARM_SECONDS, 0xFF);
        rtc.register_write(REG_STATUS_B, STATUS_B_24H | STATUS_B_ALARM_ENABLE);

        rtc.check_alarm_at(&instant(7, 29, 59));
        assert!(!rtc.take_interrupt());

        rtc.check_alarm_at(&instant(7, 30, 10));
        assert!(rtc.take_interrupt());
        rtc.check_alarm_at(&instant(7, 30, 10));
        assert!(!rtc.take_interrupt());

        assert_eq!(rtc.register_read(REG_STATUS_C), STATUS_C_IRQF | STATUS_C_ALARM);
        assert_eq!(rtc.register_read(REG_STATUS_C), 0);
    }
}
