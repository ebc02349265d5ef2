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

    snapshot.rs

    Machine state snapshots. A snapshot holds memory, the segment
    descriptors and the register state of the interrupt controller, the
    interval timer and the real-time clock. Disk images are not included;
    they stay attached across a restore.

*/

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

use crate::{
    bus::SEGMENT_COUNT,
    devices::{pic::Pic, pit::Pit, rtc::Rtc},
    machine_types::{MachineType, RamSize},
};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub version: u32,
    pub machine_type: MachineType,
    pub ram_size: RamSize,
    pub ram: Vec<u8>,
    pub rom: Vec<u8>,
    pub hr: [u16; SEGMENT_COUNT],
    pub ur: [u16; SEGMENT_COUNT],
    pub pic: Pic,
    pub pit: Pit,
    pub rtc: Rtc,
}

impl MachineSnapshot {
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let snapshot: MachineSnapshot = serde_json::from_str(json)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let file = File::create(path).map_err(|e| anyhow!("Couldn't create snapshot {}: {}", path.display(), e))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        log::debug!("Saved snapshot to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| anyhow!("Couldn't open snapshot {}: {}", path.display(), e))?;
        let snapshot: MachineSnapshot = serde_json::from_reader(BufReader::new(file))?;
        snapshot.check_version()?;
        log::debug!("Loaded snapshot from {}", path.display());
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<(), Error> {
        if self.version != SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Unsupported snapshot version {} (expected {})",
                self.version,
                SNAPSHOT_VERSION
            ));
        }
        Ok(())
    }
}
