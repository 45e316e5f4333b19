//! Snapshot trigger device.
//!
//! Lets guest software request a whole-machine snapshot. The request is
//! latched in the dispatch context and honored by the machine at the next
//! instruction boundary, never mid-instruction.
//!
//! ## Register map
//!
//! | Offset | Name | Description |
//! |--------|------|-------------|
//! | 0x00   | CMD  | any non-zero write requests a snapshot |

use log::info;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, Width};
use crate::error::{Fault, Result};

/// Guest-facing snapshot request latch.
pub struct SnapshotDevice {
    name: String,
}

impl SnapshotDevice {
    pub const REG_CMD: u32 = 0x00;

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        Ok(Self::new(config.name.clone()))
    }
}

impl Device for SnapshotDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "snapshot"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Snapshot
    }

    fn reset(&mut self) {}

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _offset: u32,
        _width: Width,
    ) -> std::result::Result<u32, Fault> {
        Ok(0)
    }

    fn mmio_write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault> {
        if offset == Self::REG_CMD && value != 0 {
            info!("snapshot requested by guest via {}", self.name);
            *ctx.snapshot_requested = true;
        }
        Ok(())
    }
}
