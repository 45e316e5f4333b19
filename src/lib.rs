//! # ducky
//!
//! A 32-bit virtual machine: an instruction-set simulator with
//! multi-core CPUs, a paged memory subsystem, an interrupt model,
//! memory-mapped I/O devices, and a boot protocol that hands a Hardware
//! Description Table to guest software.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ducky::{Machine, MachineConfig};
//!
//! fn main() -> ducky::Result<()> {
//!     let config = MachineConfig::from_str("[memory]\nsize = 65536\n", &[])?;
//!     let mut machine = Machine::new(config)?;
//!     let exit = machine.run()?;
//!     println!("machine exited: {:?}", exit);
//!     Ok(())
//! }
//! ```
//!
//! The engine is an interpreter with a single-threaded cooperative
//! scheduler: every core advances one instruction per round, then
//! devices run their timed callbacks. That keeps interrupt delivery,
//! device side effects, and memory visibility deterministic, which is
//! what makes snapshot/restore parity hold.

pub mod bus;
pub mod config;
pub mod cpu;
pub mod device;
mod error;
pub mod hdt;
pub mod irq;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod snapshot;

// Re-exports
pub use config::MachineConfig;
pub use error::{AccessKind, Error, Fault, Result};
pub use machine::{Machine, MachineExit};
