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

    machine_config.rs

    Board configuration, read from a TOML file or decoded from the legacy
    16-bit configuration word.

*/

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Error};
use serde_derive::{Deserialize, Serialize};

use crate::machine_types::{MachineType, RamSize};

pub const MAX_FLOPPY_DRIVES: usize = 4;
pub const DEFAULT_SOUND_SAMPLE_RATE: u32 = 22050;

const CONFIG_RAM_MASK: u16 = 0x0003;
const CONFIG_FLOPPY: u16 = 0x0004;
const CONFIG_TURBO: u16 = 0x0008;

const fn _default_sample_rate() -> u32 {
    DEFAULT_SOUND_SAMPLE_RATE
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MachineConfiguration {
    #[serde(default)]
    pub machine_type: MachineType,
    #[serde(default)]
    pub ram: RamSize,
    #[serde(default)]
    pub floppy_controller: bool,
    #[serde(default = "_default_sample_rate")]
    pub sound_sample_rate: u32,
    #[serde(default)]
    pub floppy: Vec<PathBuf>,
    #[serde(default)]
    pub hard_drive: Option<PathBuf>,
}

impl Default for MachineConfiguration {
    fn default() -> Self {
        Self {
            machine_type: MachineType::default(),
            ram: RamSize::default(),
            floppy_controller: false,
            sound_sample_rate: DEFAULT_SOUND_SAMPLE_RATE,
            floppy: Vec::new(),
            hard_drive: None,
        }
    }
}

impl MachineConfiguration {
    /// Decode the legacy configuration word: bits 0-1 select the RAM size, bit 2 installs the
    /// floppy controller and bit 3 selects the turbo board.
    pub fn from_bits(bits: u16) -> Self {
        Self {
            machine_type: if bits & CONFIG_TURBO != 0 {
                MachineType::Pk11_16Turbo
            }
            else {
                MachineType::Pk11_16
            },
            ram: RamSize::from_index(bits & CONFIG_RAM_MASK),
            floppy_controller: bits & CONFIG_FLOPPY != 0,
            ..Default::default()
        }
    }

    pub fn from_toml_str(toml_string: impl AsRef<str>) -> Result<Self, Error> {
        let config: MachineConfiguration = toml::from_str(toml_string.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let toml_string = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Couldn't read configuration file {}: {}", path.display(), e))?;
        log::debug!("Loading machine configuration from {}", path.display());
        Self::from_toml_str(toml_string)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.floppy.len() > MAX_FLOPPY_DRIVES {
            return Err(anyhow!(
                "{} floppy images configured, at most {} drives are supported",
                self.floppy.len(),
                MAX_FLOPPY_DRIVES
            ));
        }
        if !self.floppy.is_empty() && !self.floppy_controller {
            return Err(anyhow!("Floppy images configured without a floppy controller"));
        }
        if self.sound_sample_rate == 0 {
            return Err(anyhow!("Sound sample rate must be non-zero"));
        }
        Ok(())
    }

    pub fn steps_per_tick(&self) -> u32 {
        self.machine_type.steps_per_tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits() {
        let config = MachineConfiguration::from_bits(0x000E);
        assert_eq!(config.ram, RamSize::Ram2048K);
        assert!(config.floppy_controller);
        assert_eq!(config.machine_type, MachineType::Pk11_16Turbo);

        let config = MachineConfiguration::from_bits(0);
        assert_eq!(config.ram, RamSize::Ram512K);
        assert!(!config.floppy_controller);
        assert_eq!(config.steps_per_tick(), 8);
    }

    #[test]
    fn test_from_toml() {
        let config = MachineConfiguration::from_toml_str(
            r#"
            machine_type = "Pk11_16Turbo"
            ram = "Ram1024K"
            floppy_controller = true
            floppy = ["boot.img"]
            hard_drive = "hdd.img"
            "#,
        )
        .unwrap();
        assert_eq!(config.machine_type, MachineType::Pk11_16Turbo);
        assert_eq!(config.ram.bytes(), 1024 * 1024);
        assert_eq!(config.sound_sample_rate, DEFAULT_SOUND_SAMPLE_RATE);
        assert_eq!(config.floppy, vec![PathBuf::from("boot.img")]);
        assert_eq!(config.hard_drive, Some(PathBuf::from("hdd.img")));
    }

    #[test]
    fn test_defaults_and_validation() {
        let config = MachineConfiguration::from_toml_str("").unwrap();
        assert_eq!(config, MachineConfiguration::default());

        assert!(MachineConfiguration::from_toml_str("floppy = [\"a.img\"]").is_err());
        assert!(MachineConfiguration::from_toml_str("ram = \"Ram8M\"").is_err());
        assert!(MachineConfiguration::from_toml_str("sound_sample_rate = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(&path, "floppy_controller = true\nsound_sample_rate = 44100\n").unwrap();
        let config = MachineConfiguration::load(&path).unwrap();
        assert!(config.floppy_controller);
        assert_eq!(config.sound_sample_rate, 44100);

        assert!(MachineConfiguration::load(dir.path().join("missing.toml")).is_err());
    }
}
