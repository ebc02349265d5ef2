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

    machine_types.rs

    Enumerations of the board variants and RAM configurations.

*/

use std::{fmt, fmt::Display, str::FromStr};

use serde_derive::{Deserialize, Serialize};
use strum_macros::EnumIter;

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Hash, Eq, PartialEq, EnumIter)]
pub enum MachineType {
    #[default]
    Pk11_16,
    Pk11_16Turbo,
}

impl FromStr for MachineType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "pk11_16" | "pk-11/16" => Ok(MachineType::Pk11_16),
            "pk11_16turbo" | "pk-11/16 turbo" | "turbo" => Ok(MachineType::Pk11_16Turbo),
            _ => Err("Bad value for machine type".to_string()),
        }
    }
}

impl Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineType::Pk11_16 => write!(f, "PK-11/16"),
            MachineType::Pk11_16Turbo => write!(f, "PK-11/16 Turbo"),
        }
    }
}

impl MachineType {
    /// Number of processor micro-steps issued per frame tick.
    pub fn steps_per_tick(&self) -> u32 {
        match self {
            MachineType::Pk11_16 => 8,
            MachineType::Pk11_16Turbo => 16,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Hash, Eq, PartialEq, EnumIter)]
pub enum RamSize {
    #[default]
    Ram512K,
    Ram1024K,
    Ram2048K,
    Ram4096K,
}

impl FromStr for RamSize {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "512k" | "ram512k" => Ok(RamSize::Ram512K),
            "1024k" | "1m" | "ram1024k" => Ok(RamSize::Ram1024K),
            "2048k" | "2m" | "ram2048k" => Ok(RamSize::Ram2048K),
            "4096k" | "4m" | "ram4096k" => Ok(RamSize::Ram4096K),
            _ => Err("Bad value for RAM size".to_string()),
        }
    }
}

impl RamSize {
    /// Decode the two-bit RAM size field of the legacy configuration word.
    pub fn from_index(index: u16) -> RamSize {
        match index & 0x03 {
            0 => RamSize::Ram512K,
            1 => RamSize::Ram1024K,
            2 => RamSize::Ram2048K,
            _ => RamSize::Ram4096K,
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            RamSize::Ram512K => 512 * 1024,
            RamSize::Ram1024K => 1024 * 1024,
            RamSize::Ram2048K => 2048 * 1024,
            RamSize::Ram4096K => 4096 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_machine_type_from_str() {
        assert_eq!("PK11_16".parse::<MachineType>(), Ok(MachineType::Pk11_16));
        assert_eq!("Turbo".parse::<MachineType>(), Ok(MachineType::Pk11_16Turbo));
        assert!("pk11_32".parse::<MachineType>().is_err());
        assert_eq!(MachineType::Pk11_16Turbo.steps_per_tick(), 16);
    }

    #[test]
    fn test_ram_size() {
        assert_eq!("2M".parse::<RamSize>(), Ok(RamSize::Ram2048K));
        assert_eq!(RamSize::from_index(3).bytes(), 4 * 1024 * 1024);
        assert_eq!(RamSize::default().bytes(), 0x80000);
    }

    #[test]
    fn test_config_index_covers_every_size() {
        for (i, size) in RamSize::iter().enumerate() {
            assert_eq!(RamSize::from_index(i as u16), size);
            assert_eq!(size.bytes(), (512 * 1024) << i);
        }
        for machine in MachineType::iter() {
            assert_eq!(machine.to_string().parse::<MachineType>(), Ok(machine));
        }
    }
}
