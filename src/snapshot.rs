//! Whole-machine snapshots.
//!
//! A snapshot captures every observable component: per-core register
//! files, flags, undelivered traps and interrupt-controller state, all
//! allocated memory pages, and each device's own state blob. Restoring
//! from a snapshot and continuing must be indistinguishable from never
//! having snapshotted (the caches are advisory and are simply flushed).
//!
//! The on-disk format is JSON; device state is free-form per driver.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpu::RegisterFile;
use crate::cpu::math::MathCoprocessor;
use crate::error::{Error, Fault, Result};
use crate::irq::InterruptController;
use crate::memory::Page;

/// Serialized state of one core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreState {
    pub id: usize,
    pub regs: RegisterFile,
    /// Flags word (see `CoreFlags::to_word`).
    pub flags: u32,
    pub inst_set: u32,
    pub inst_set_stack: Vec<u32>,
    pub alive: bool,
    pub exit_code: u32,
    pub pending_fault: Option<Fault>,
    pub frames: Vec<u32>,
    pub pic: InterruptController,
    pub pt_base: u32,
    pub pt_enabled: bool,
    pub math: Option<MathCoprocessor>,
}

/// Serialized physical memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    pub size: u32,
    pub pages: Vec<Page>,
}

/// Serialized state of one device, keyed by instance name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub name: String,
    pub driver: String,
    pub state: serde_json::Value,
}

/// A complete machine snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    /// Virtual-time counter at the capture boundary.
    pub ticks: u64,
    pub cores: Vec<CoreState>,
    pub memory: MemoryState,
    pub devices: Vec<DeviceState>,
}

impl MachineState {
    /// Write the snapshot to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .map_err(|e| Error::SnapshotFormat(e.to_string()))
    }

    /// Read a snapshot from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| Error::SnapshotFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_file_roundtrip() {
        let state = MachineState {
            ticks: 42,
            cores: vec![CoreState {
                id: 0,
                regs: RegisterFile {
                    r: [7; 30],
                    fp: 1,
                    sp: 2,
                    ip: 3,
                },
                flags: 0x41,
                inst_set: 0,
                inst_set_stack: vec![],
                alive: true,
                exit_code: 0,
                pending_fault: Some(Fault::DivisionByZero),
                frames: vec![],
                pic: InterruptController::new(),
                pt_base: 0x1_0000,
                pt_enabled: false,
                math: None,
            }],
            memory: MemoryState {
                size: 0x1000,
                pages: vec![Page::new(3)],
            },
            devices: vec![DeviceState {
                name: "kbd0".to_string(),
                driver: "keyboard".to_string(),
                state: serde_json::json!({"queue": [1, 2]}),
            }],
        };

        let path = std::env::temp_dir().join(format!("ducky-snap-{}.json", std::process::id()));
        state.save(&path).unwrap();
        let restored = MachineState::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.ticks, 42);
        assert_eq!(restored.cores[0].regs, state.cores[0].regs);
        assert_eq!(restored.cores[0].pending_fault, Some(Fault::DivisionByZero));
        assert_eq!(restored.memory.pages[0].index, 3);
        assert_eq!(restored.devices[0].state["queue"][1], 2);
    }
}
