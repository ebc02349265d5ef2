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

    devices::pit.rs

    Implements the three channel Programmable Interval Timer.

    Each channel is ticked once per frame tick by the bus. Channel 0's
    output drives an interrupt controller input, channel 2's output is
    the speaker bit and its gate is driven by the sound register.

*/

use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bus::IoDevice;

pub const PIT_CHANNEL_0_DATA_PORT: u16 = 0o161010;
pub const PIT_CHANNEL_1_DATA_PORT: u16 = 0o161012;
pub const PIT_CHANNEL_2_DATA_PORT: u16 = 0o161014;
pub const PIT_COMMAND_REGISTER: u16 = 0o161016;

pub const PIT_CHANNEL_COUNT: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    InterruptOnTerminalCount,
    HardwareRetriggerableOneShot,
    RateGenerator,
    SquareWaveGenerator,
    SoftwareTriggeredStrobe,
    HardwareTriggeredStrobe,
}

// We implement From<u8> for this enum ourselves rather than deriving BitfieldSpecifier
// as there is more than one bit mapping per Enum variant (6 and 7 map to modes 2 & 3 again)
impl From<u8> for ChannelMode {
    fn from(orig: u8) -> Self {
        match orig & 0x07 {
            0x0 => ChannelMode::InterruptOnTerminalCount,
            0x1 => ChannelMode::HardwareRetriggerableOneShot,
            0x2 | 0x6 => ChannelMode::RateGenerator,
            0x3 | 0x7 => ChannelMode::SquareWaveGenerator,
            0x4 => ChannelMode::SoftwareTriggeredStrobe,
            _ => ChannelMode::HardwareTriggeredStrobe,
        }
    }
}

#[derive(Debug, PartialEq, BitfieldSpecifier)]
enum RwModeField {
    LatchCommand,
    Lsb,
    Msb,
    LsbMsb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RwMode {
    Lsb,
    Msb,
    LsbMsb,
}

#[bitfield]
#[allow(dead_code)]
pub struct ControlByte {
    bcd: bool,
    channel_mode: B3,
    rw_mode: RwModeField,
    channel: B2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    WaitingForReload,
    WaitingForLoadCycle,
    WaitingForGate,
    Counting,
    TerminalCount,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum LoadState {
    WaitingForLsb,
    WaitingForMsb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    c: usize,
    mode: ChannelMode,
    rw_mode: RwMode,
    bcd: bool,
    state: ChannelState,
    count_register: u16,
    lsb: u8,
    load_state: LoadState,
    counting_element: u32,
    latch: Option<u16>,
    read_msb: bool,
    output: bool,
    gate: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgrammableIntervalTimer {
    channels: [Channel; PIT_CHANNEL_COUNT],
}
pub type Pit = ProgrammableIntervalTimer;

impl Default for ProgrammableIntervalTimer {
    fn default() -> Self {
        Self {
            channels: std::array::from_fn(Channel::new),
        }
    }
}

impl IoDevice for ProgrammableIntervalTimer {
    fn read_u16(&mut self, port: u16) -> u16 {
        match port {
            PIT_COMMAND_REGISTER => {
                log::warn!("PIT: Read from write-only control register");
                0
            }
            _ => self.channels[Self::port_channel(port)].read_byte() as u16,
        }
    }

    fn write_u16(&mut self, port: u16, data: u16) {
        match port {
            PIT_COMMAND_REGISTER => self.control_register_write(data as u8),
            _ => self.channels[Self::port_channel(port)].write_byte(data as u8),
        }
    }

    fn peek_u16(&self, port: u16) -> Option<u16> {
        match port {
            PIT_COMMAND_REGISTER => None,
            _ => Some(self.channels[Self::port_channel(port)].peek_byte() as u16),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("PIT Channel 0 Data"), PIT_CHANNEL_0_DATA_PORT),
            (String::from("PIT Channel 1 Data"), PIT_CHANNEL_1_DATA_PORT),
            (String::from("PIT Channel 2 Data"), PIT_CHANNEL_2_DATA_PORT),
            (String::from("PIT Control Register"), PIT_COMMAND_REGISTER),
        ]
    }
}

fn bcd_to_bin(value: u16) -> u32 {
    let mut result = 0;
    let mut scale = 1;
    let mut value = value;
    for _ in 0..4 {
        result += ((value & 0x0F) as u32).min(9) * scale;
        value >>= 4;
        scale *= 10;
    }
    result
}

fn bin_to_bcd(value: u32) -> u16 {
    let mut result = 0u16;
    let mut value = value % 10000;
    for shift in 0..4 {
        result |= ((value % 10) as u16) << (shift * 4);
        value /= 10;
    }
    result
}

impl Channel {
    pub fn new(c: usize) -> Self {
        Channel {
            c,
            mode: ChannelMode::InterruptOnTerminalCount,
            rw_mode: RwMode::Lsb,
            bcd: false,
            state: ChannelState::WaitingForReload,
            count_register: 0,
            lsb: 0,
            load_state: LoadState::WaitingForLsb,
            counting_element: 0,
            latch: None,
            read_msb: false,
            output: false,
            gate: true,
        }
    }

    pub fn set_mode(&mut self, mode: ChannelMode, rw_mode: RwMode, bcd: bool) {
        log::trace!(
            "PIT: Channel {} selected, channel_mode {:?}, rw mode {:?}, bcd: {:?}",
            self.c,
            mode,
            rw_mode,
            bcd
        );
        self.mode = mode;
        self.rw_mode = rw_mode;
        self.bcd = bcd;
        self.state = ChannelState::WaitingForReload;
        self.load_state = LoadState::WaitingForLsb;
        self.latch = None;
        self.read_msb = false;
        self.counting_element = 0;
        // Mode 0 is the only mode whose output idles low.
        self.output = mode != ChannelMode::InterruptOnTerminalCount;
    }

    /// Return the reload value in binary, with 0 standing for the maximum count.
    fn reload_value(&self) -> u32 {
        let value = if self.bcd {
            bcd_to_bin(self.count_register)
        }
        else {
            self.count_register as u32
        };
        match (value, self.bcd) {
            (0, false) => 0x10000,
            (0, true) => 10000,
            _ => value,
        }
    }

    /// Length of the next square wave half cycle in counter units. Odd counts give the high half
    /// one more tick than the low half.
    fn square_wave_half(&self) -> u32 {
        let n = self.reload_value();
        if n & 1 == 0 {
            n
        }
        else if self.output {
            n + 1
        }
        else {
            (n - 1).max(2)
        }
    }

    /// Return the live counter value as the guest would read it.
    pub fn count(&self) -> u16 {
        if self.bcd {
            bin_to_bcd(self.counting_element)
        }
        else {
            self.counting_element as u16
        }
    }

    pub fn latch_count(&mut self) {
        if self.latch.is_none() {
            self.latch = Some(self.count());
            self.read_msb = false;
            log::trace!("PIT: Channel {} latched count {:04X}", self.c, self.count());
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        match self.rw_mode {
            RwMode::Lsb => {
                self.count_register = byte as u16;
                self.finalize_load();
            }
            RwMode::Msb => {
                self.count_register = (byte as u16) << 8;
                self.finalize_load();
            }
            RwMode::LsbMsb => match self.load_state {
                LoadState::WaitingForLsb => {
                    self.lsb = byte;
                    self.load_state = LoadState::WaitingForMsb;
                    if self.mode == ChannelMode::InterruptOnTerminalCount {
                        // Writing the first byte stops the count in mode 0.
                        self.state = ChannelState::WaitingForReload;
                        self.output = false;
                    }
                }
                LoadState::WaitingForMsb => {
                    self.count_register = (byte as u16) << 8 | self.lsb as u16;
                    self.load_state = LoadState::WaitingForLsb;
                    self.finalize_load();
                }
            },
        }
    }

    fn finalize_load(&mut self) {
        log::trace!("PIT: Channel {} loaded count {:04X}", self.c, self.count_register);
        match self.mode {
            ChannelMode::InterruptOnTerminalCount => {
                self.output = false;
                self.state = ChannelState::WaitingForLoadCycle;
            }
            ChannelMode::SoftwareTriggeredStrobe => {
                self.state = ChannelState::WaitingForLoadCycle;
            }
            ChannelMode::HardwareRetriggerableOneShot | ChannelMode::HardwareTriggeredStrobe => {
                if self.state == ChannelState::WaitingForReload {
                    self.state = ChannelState::WaitingForGate;
                }
            }
            ChannelMode::RateGenerator | ChannelMode::SquareWaveGenerator => {
                // A running counter picks up the new count at its next reload.
                if self.state == ChannelState::WaitingForReload {
                    self.state = ChannelState::WaitingForLoadCycle;
                }
            }
        }
    }

    fn read_value(&self) -> u16 {
        self.latch.unwrap_or_else(|| self.count())
    }

    pub fn read_byte(&mut self) -> u8 {
        let value = self.read_value();
        let (byte, done) = match self.rw_mode {
            RwMode::Lsb => (value as u8, true),
            RwMode::Msb => ((value >> 8) as u8, true),
            RwMode::LsbMsb => {
                if self.read_msb {
                    ((value >> 8) as u8, true)
                }
                else {
                    (value as u8, false)
                }
            }
        };
        if done {
            self.read_msb = false;
            self.latch = None;
        }
        else {
            self.read_msb = true;
        }
        byte
    }

    fn peek_byte(&self) -> u8 {
        let value = self.read_value();
        match self.rw_mode {
            RwMode::Msb => (value >> 8) as u8,
            RwMode::LsbMsb if self.read_msb => (value >> 8) as u8,
            _ => value as u8,
        }
    }

    pub fn set_gate(&mut self, new_state: bool) {
        let rising = !self.gate && new_state;
        let falling = self.gate && !new_state;
        self.gate = new_state;

        match self.mode {
            ChannelMode::RateGenerator | ChannelMode::SquareWaveGenerator => {
                if falling {
                    self.output = true;
                }
                if rising && self.state != ChannelState::WaitingForReload {
                    self.state = ChannelState::WaitingForLoadCycle;
                }
            }
            ChannelMode::HardwareRetriggerableOneShot => {
                if rising && self.state != ChannelState::WaitingForReload {
                    self.counting_element = self.reload_value();
                    self.output = false;
                    self.state = ChannelState::Counting;
                }
            }
            ChannelMode::HardwareTriggeredStrobe => {
                if rising && self.state != ChannelState::WaitingForReload {
                    self.counting_element = self.reload_value();
                    self.state = ChannelState::Counting;
                }
            }
            _ => {}
        }
    }

    pub fn gate(&self) -> bool {
        self.gate
    }

    pub fn output(&self) -> bool {
        self.output
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Advance the channel by one timer clock.
    pub fn tick(&mut self) {
        match self.state {
            ChannelState::WaitingForReload | ChannelState::WaitingForGate => {}
            ChannelState::WaitingForLoadCycle => {
                if self.mode == ChannelMode::SquareWaveGenerator {
                    self.output = true;
                    self.counting_element = self.square_wave_half();
                }
                else {
                    self.counting_element = self.reload_value();
                }
                if self.mode == ChannelMode::RateGenerator {
                    self.output = true;
                }
                self.state = ChannelState::Counting;
            }
            ChannelState::Counting => {
                let gated = matches!(
                    self.mode,
                    ChannelMode::InterruptOnTerminalCount
                        | ChannelMode::RateGenerator
                        | ChannelMode::SquareWaveGenerator
                        | ChannelMode::SoftwareTriggeredStrobe
                );
                if gated && !self.gate {
                    return;
                }
                self.tick_counting();
            }
            ChannelState::TerminalCount => {
                // Strobe modes hold their output low for a single clock.
                if !self.output
                    && matches!(
                        self.mode,
                        ChannelMode::SoftwareTriggeredStrobe | ChannelMode::HardwareTriggeredStrobe
                    )
                {
                    self.output = true;
                }
            }
        }
    }

    fn tick_counting(&mut self) {
        match self.mode {
            ChannelMode::InterruptOnTerminalCount => {
                self.counting_element = self.counting_element.saturating_sub(1);
                if self.counting_element <= 1 {
                    self.output = true;
                    self.state = ChannelState::TerminalCount;
                }
            }
            ChannelMode::RateGenerator => {
                if self.counting_element <= 1 {
                    self.counting_element = self.reload_value();
                    self.output = true;
                }
                else {
                    self.counting_element -= 1;
                    if self.counting_element == 1 {
                        self.output = false;
                    }
                }
            }
            ChannelMode::SquareWaveGenerator => {
                self.counting_element = self.counting_element.saturating_sub(2);
                if self.counting_element == 0 {
                    self.output = !self.output;
                    self.counting_element = self.square_wave_half();
                }
            }
            ChannelMode::HardwareRetriggerableOneShot => {
                self.counting_element = self.counting_element.saturating_sub(1);
                if self.counting_element == 0 {
                    self.output = true;
                    self.state = ChannelState::TerminalCount;
                }
            }
            ChannelMode::SoftwareTriggeredStrobe | ChannelMode::HardwareTriggeredStrobe => {
                self.counting_element = self.counting_element.saturating_sub(1);
                if self.counting_element == 0 {
                    self.output = false;
                    self.state = ChannelState::TerminalCount;
                }
            }
        }
    }
}

impl ProgrammableIntervalTimer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    fn port_channel(port: u16) -> usize {
        match port {
            PIT_CHANNEL_0_DATA_PORT => 0,
            PIT_CHANNEL_1_DATA_PORT => 1,
            PIT_CHANNEL_2_DATA_PORT => 2,
            _ => unreachable!("PIT: Bad port #"),
        }
    }

    pub fn control_register_write(&mut self, byte: u8) {
        let control = ControlByte::from_bytes([byte]);
        let c = control.channel() as usize;
        if c >= PIT_CHANNEL_COUNT {
            log::warn!("PIT: Read-back command not supported: {:02X}", byte);
            return;
        }

        match control.rw_mode() {
            RwModeField::LatchCommand => self.channels[c].latch_count(),
            rw_field => {
                let rw_mode = match rw_field {
                    RwModeField::Lsb => RwMode::Lsb,
                    RwModeField::Msb => RwMode::Msb,
                    _ => RwMode::LsbMsb,
                };
                self.channels[c].set_mode(ChannelMode::from(control.channel_mode()), rw_mode, control.bcd());
            }
        }
    }

    /// Tick every channel once. Returns a bitmask of channels whose output rose on this tick.
    pub fn tick(&mut self) -> u8 {
        let mut edges = 0;
        for (i, channel) in self.channels.iter_mut().enumerate() {
            let old_output = channel.output;
            channel.tick();
            if !old_output && channel.output {
                edges |= 1 << i;
            }
        }
        edges
    }

    pub fn set_gate(&mut self, c: usize, state: bool) {
        self.channels[c].set_gate(state);
    }

    pub fn gate(&self, c: usize) -> bool {
        self.channels[c].gate()
    }

    pub fn output(&self, c: usize) -> bool {
        self.channels[c].output()
    }

    pub fn channel(&self, c: usize) -> &Channel {
        &self.channels[c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Channel 0, lsb/msb access, binary, given mode.
    fn control(c: u8, mode: u8) -> u16 {
        ((c << 6) | (0b11 << 4) | (mode << 1)) as u16
    }

    fn load(pit: &mut Pit, port: u16, count: u16) {
        pit.write_u16(port, count & 0xFF);
        pit.write_u16(port, count >> 8);
    }

    fn output_transitions(pit: &mut Pit, c: usize, ticks: usize) -> Vec<usize> {
        let mut last = pit.output(c);
        let mut transitions = Vec::new();
        for t in 0..ticks {
            pit.tick();
            if pit.output(c) != last {
                transitions.push(t);
                last = pit.output(c);
            }
        }
        transitions
    }

    #[test]
    fn test_square_wave_even_count_is_symmetric() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(0, 3));
        load(&mut pit, PIT_CHANNEL_0_DATA_PORT, 10);

        let transitions = output_transitions(&mut pit, 0, 40);
        assert_eq!(transitions.len(), 7);
        for pair in transitions.windows(2) {
            assert_eq!(pair[1] - pair[0], 5);
        }
    }

    #[test]
    fn test_square_wave_odd_count() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(0, 3));
        load(&mut pit, PIT_CHANNEL_0_DATA_PORT, 7);

        let transitions = output_transitions(&mut pit, 0, 28);
        // High halves last 4 ticks, low halves 3.
        let halves: Vec<usize> = transitions.windows(2).map(|p| p[1] - p[0]).collect();
        assert_eq!(&halves[..4], &[3, 4, 3, 4]);
    }

    #[test]
    fn test_square_wave_gate_pauses_and_forces_high() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(2, 3));
        load(&mut pit, PIT_CHANNEL_2_DATA_PORT, 4);
        for _ in 0..4 {
            pit.tick();
        }
        assert!(!pit.output(2));
        pit.set_gate(2, false);
        assert!(pit.output(2));
        for _ in 0..20 {
            pit.tick();
        }
        assert!(pit.output(2));
    }

    #[test]
    fn test_terminal_count_mode() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(1, 0));
        assert!(!pit.output(1));
        load(&mut pit, PIT_CHANNEL_1_DATA_PORT, 5);

        // Load cycle, then the count runs from 5 down to 1.
        for _ in 0..4 {
            pit.tick();
            assert!(!pit.output(1));
        }
        pit.tick();
        assert!(pit.output(1));
        for _ in 0..100 {
            pit.tick();
            assert!(pit.output(1));
        }
    }

    #[test]
    fn test_rate_generator_edges() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(0, 2));
        load(&mut pit, PIT_CHANNEL_0_DATA_PORT, 8);

        let mut edge_ticks = Vec::new();
        for t in 0..40 {
            if pit.tick() & 0x01 != 0 {
                edge_ticks.push(t);
            }
        }
        assert!(edge_ticks.len() >= 4);
        for pair in edge_ticks.windows(2) {
            assert_eq!(pair[1] - pair[0], 8);
        }
    }

    #[test]
    fn test_latched_read_freezes_value() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(0, 2));
        load(&mut pit, PIT_CHANNEL_0_DATA_PORT, 1000);
        for _ in 0..11 {
            pit.tick();
        }
        // Latch command for channel 0.
        pit.write_u16(PIT_COMMAND_REGISTER, 0x00);
        let expected = pit.channel(0).count();
        assert_eq!(expected, 990);
        for _ in 0..7 {
            pit.tick();
        }
        assert_eq!(pit.peek_u16(PIT_CHANNEL_0_DATA_PORT), Some(expected & 0xFF));
        let lo = pit.read_u16(PIT_CHANNEL_0_DATA_PORT);
        let hi = pit.read_u16(PIT_CHANNEL_0_DATA_PORT);
        assert_eq!(hi << 8 | lo, expected);

        // Latch released, reads follow the live counter again.
        let lo = pit.read_u16(PIT_CHANNEL_0_DATA_PORT);
        let hi = pit.read_u16(PIT_CHANNEL_0_DATA_PORT);
        assert_eq!(hi << 8 | lo, 983);
    }

    #[test]
    fn test_bcd_reload() {
        let mut pit = Pit::new();
        pit.write_u16(PIT_COMMAND_REGISTER, control(0, 2) | 0x01);
        load(&mut pit, PIT_CHANNEL_0_DATA_PORT, 0x0100);
        pit.tick();
        pit.tick();
        assert_eq!(pit.channel(0).count(), 0x0099);
    }
}
