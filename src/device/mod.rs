//! Virtual device emulation.
//!
//! Devices implement the bus contract ([`Device`]): MMIO register access,
//! an optional virtual-time callback, and snapshot state. Side effects
//! (raising IRQs, requesting snapshots, forwarding host input) go through
//! the [`DeviceContext`] handed into every call, so devices never hold
//! references into the rest of the machine.
//!
//! Construction goes through a compile-time registry keyed by the
//! `driver` string from the configuration; an unknown driver is a
//! configuration error.

pub mod blockio;
pub mod keyboard;
pub mod rtc;
pub mod snapshot;
pub mod svga;
pub mod terminal;
pub mod tty;

pub use blockio::BlockIo;
pub use keyboard::Keyboard;
pub use rtc::Rtc;
pub use snapshot::SnapshotDevice;
pub use svga::Svga;
pub use terminal::Terminal;
pub use tty::Tty;

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::error::{Error, Fault, Result};
use crate::memory::MemoryController;

/// Shared host-side byte sink (stdout, a file, or a test buffer).
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Well-known console ports in the 16-bit I/O-port space.
pub mod conio {
    pub const STDIN: u16 = 0x100;
    pub const STDOUT: u16 = 0x100;
    pub const STDERR: u16 = 0x101;
}

/// Access width of an MMIO operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Short,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Short => 2,
            Width::Word => 4,
        }
    }
}

/// Logical device class, also used as the HDT device-record flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Rtc,
    Input,
    Output,
    Terminal,
    Storage,
    Snapshot,
    Display,
}

impl DeviceClass {
    pub fn code(self) -> u16 {
        match self {
            DeviceClass::Rtc => 1,
            DeviceClass::Input => 2,
            DeviceClass::Output => 3,
            DeviceClass::Terminal => 4,
            DeviceClass::Storage => 5,
            DeviceClass::Snapshot => 6,
            DeviceClass::Display => 7,
        }
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rtc" => Ok(DeviceClass::Rtc),
            "input" => Ok(DeviceClass::Input),
            "output" => Ok(DeviceClass::Output),
            "terminal" => Ok(DeviceClass::Terminal),
            "storage" => Ok(DeviceClass::Storage),
            "snapshot" => Ok(DeviceClass::Snapshot),
            "display" => Ok(DeviceClass::Display),
            other => Err(Error::Configuration(format!("unknown device class: {}", other))),
        }
    }
}

/// Per-dispatch context: the machine resources a device may touch while
/// handling an MMIO access or a timed callback.
pub struct DeviceContext<'a> {
    /// Physical memory, for device DMA.
    pub mem: &'a mut MemoryController,
    /// IRQ numbers raised during this dispatch; the machine drains them
    /// into the target core's interrupt controller.
    pub raised: &'a mut Vec<u32>,
    /// Virtual-time counter: instructions executed so far.
    pub now: u64,
    /// Set by the snapshot device; honored at the next boundary.
    pub snapshot_requested: &'a mut bool,
    /// Host input bytes addressed to another device (index, byte);
    /// routed by the bus after the current dispatch.
    pub input: &'a mut Vec<(usize, u8)>,
}

/// The bus contract every device implements.
pub trait Device: Send {
    /// Instance name from the configuration (HDT name, <= 10 bytes).
    fn name(&self) -> &str;

    /// Driver identifier (HDT identifier, <= 32 bytes).
    fn driver(&self) -> &'static str;

    fn klass(&self) -> DeviceClass;

    /// IRQ line assigned to this device, if any.
    fn irq(&self) -> Option<u32> {
        None
    }

    /// Bytes of MMIO address space this device occupies when the
    /// configuration does not size its region explicitly.
    fn mmio_region_size(&self) -> u32 {
        0x100
    }

    /// Start host-side plumbing (reader threads). Called once when the
    /// machine enters its run loop interactively.
    fn start(&mut self) {}

    /// Reset to power-on state.
    fn reset(&mut self);

    /// Read a register. `offset` is relative to the device's MMIO base.
    fn mmio_read(&mut self, ctx: &mut DeviceContext<'_>, offset: u32, width: Width)
        -> std::result::Result<u32, Fault>;

    /// Write a register. Side effects happen synchronously within the
    /// call.
    fn mmio_write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault>;

    /// Byte read from the device's I/O-port window.
    fn io_read(&mut self, _ctx: &mut DeviceContext<'_>, _offset: u16)
        -> std::result::Result<u8, Fault> {
        Ok(0xFF)
    }

    /// Byte write to the device's I/O-port window.
    fn io_write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _offset: u16,
        _value: u8,
    ) -> std::result::Result<(), Fault> {
        Ok(())
    }

    /// Virtual-time callback, invoked once per scheduler round.
    fn tick(&mut self, _ctx: &mut DeviceContext<'_>) {}

    /// Host input routed to this device (see [`DeviceContext::input`]).
    fn receive_input(&mut self, _ctx: &mut DeviceContext<'_>, _byte: u8) {}

    /// Capability seam: attach a host output sink (terminal wiring).
    fn attach_output(&mut self, _writer: SharedWriter) {}

    /// Capability seam: device index this device forwards host input to.
    fn wire_input_sink(&mut self, _index: usize) {}

    /// Serializable device state for snapshots.
    fn save_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Restore state captured by [`Device::save_state`].
    fn load_state(&mut self, _state: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Instantiate a device from its configuration entry.
///
/// The registry is compile-time: adding a driver means adding a match arm
/// here.
pub fn create(config: &DeviceConfig) -> Result<Box<dyn Device>> {
    match config.driver.as_str() {
        "rtc" => Ok(Box::new(Rtc::from_config(config)?)),
        "keyboard" => Ok(Box::new(Keyboard::from_config(config)?)),
        "tty" => Ok(Box::new(Tty::from_config(config)?)),
        "terminal" => Ok(Box::new(Terminal::from_config(config)?)),
        "blockio" => Ok(Box::new(BlockIo::from_config(config)?)),
        "snapshot" => Ok(Box::new(SnapshotDevice::from_config(config)?)),
        "svga" => Ok(Box::new(Svga::from_config(config)?)),
        other => Err(Error::UnknownDriver(other.to_string())),
    }
}
