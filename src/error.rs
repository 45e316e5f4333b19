//! Error types for ducky.
//!
//! Two worlds are kept strictly apart:
//!
//! - [`Fault`] is guest-visible. A fault raised while executing an
//!   instruction becomes a pending interrupt at the next instruction
//!   boundary and the machine keeps running.
//! - [`Error`] is host-side. Configuration problems, malformed binaries,
//!   and host I/O loss terminate the machine instead of entering the
//!   guest interrupt path.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ducky's host [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The access that triggered a memory fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Numeric code stored in the fault-context word pushed for handlers.
    pub fn code(self) -> u32 {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
            AccessKind::Execute => 2,
        }
    }
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
            AccessKind::Execute => write!(f, "execute"),
        }
    }
}

/// Guest-visible traps. Each variant maps onto one of the reserved IVT
/// slots 0..8 via [`Fault::vector`]. Serializable because an undelivered
/// trap is part of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Fault {
    /// Unknown or reserved opcode value.
    InvalidOpcode(u32),
    /// Translation miss or unallocated page.
    PageFault { addr: u32, kind: AccessKind },
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// Page flags or ownership forbid the access.
    AccessViolation { addr: u32, kind: AccessKind },
    /// Word or short access on an odd boundary with strict alignment on.
    UnalignedAccess { addr: u32 },
    /// Fault raised while delivering another fault.
    DoubleFault,
    /// Privileged instruction in user mode.
    PrivilegeFault,
    /// Interrupt index outside the vector table.
    InvalidIrq(u32),
    /// Math coprocessor stack misuse (type mismatch, overflow, underflow).
    CoprocessorFault,
    /// Physical address not routed to memory or any MMIO region.
    MmioFault { addr: u32, kind: AccessKind },
    /// Physical address outside the configured memory region entirely.
    InvalidAddress { addr: u32, kind: AccessKind },
}

impl Fault {
    /// IVT slot this fault is delivered on.
    ///
    /// Slots 0..8 are reserved in this order: invalid opcode, page fault,
    /// division by zero, protection fault, unaligned access, double
    /// fault, privilege violation, invalid IRQ. Unrouted MMIO and
    /// out-of-range addresses share the page-fault slot; the fault-context
    /// words let handlers tell them apart. Coprocessor faults share the
    /// protection-fault slot.
    pub fn vector(self) -> u32 {
        match self {
            Fault::InvalidOpcode(_) => 0,
            Fault::PageFault { .. } => 1,
            Fault::MmioFault { .. } => 1,
            Fault::InvalidAddress { .. } => 1,
            Fault::DivisionByZero => 2,
            Fault::AccessViolation { .. } => 3,
            Fault::CoprocessorFault => 3,
            Fault::UnalignedAccess { .. } => 4,
            Fault::DoubleFault => 5,
            Fault::PrivilegeFault => 6,
            Fault::InvalidIrq(_) => 7,
        }
    }

    /// Faulting address for the first fault-context word, when there is one.
    pub fn context_addr(self) -> u32 {
        match self {
            Fault::PageFault { addr, .. }
            | Fault::AccessViolation { addr, .. }
            | Fault::UnalignedAccess { addr }
            | Fault::MmioFault { addr, .. }
            | Fault::InvalidAddress { addr, .. } => addr,
            Fault::InvalidOpcode(op) => op,
            Fault::InvalidIrq(irq) => irq,
            _ => 0,
        }
    }

    /// Access-kind code for the second fault-context word.
    pub fn context_kind(self) -> u32 {
        match self {
            Fault::PageFault { kind, .. }
            | Fault::AccessViolation { kind, .. }
            | Fault::MmioFault { kind, .. }
            | Fault::InvalidAddress { kind, .. } => kind.code(),
            _ => 0,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::InvalidOpcode(op) => write!(f, "invalid opcode: 0x{:02x}", op),
            Fault::PageFault { addr, kind } => {
                write!(f, "page fault: addr=0x{:08x}, kind={}", addr, kind)
            }
            Fault::DivisionByZero => write!(f, "division by zero"),
            Fault::AccessViolation { addr, kind } => {
                write!(f, "access violation: addr=0x{:08x}, kind={}", addr, kind)
            }
            Fault::UnalignedAccess { addr } => {
                write!(f, "unaligned access: addr=0x{:08x}", addr)
            }
            Fault::DoubleFault => write!(f, "double fault"),
            Fault::PrivilegeFault => write!(f, "privileged instruction in user mode"),
            Fault::InvalidIrq(irq) => write!(f, "invalid interrupt index: {}", irq),
            Fault::CoprocessorFault => write!(f, "coprocessor fault"),
            Fault::MmioFault { addr, kind } => {
                write!(f, "unrouted MMIO access: addr=0x{:08x}, kind={}", addr, kind)
            }
            Fault::InvalidAddress { addr, kind } => {
                write!(f, "address outside memory: addr=0x{:08x}, kind={}", addr, kind)
            }
        }
    }
}

/// Host-side errors that terminate the machine.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid memory size: {0} bytes (must be a non-zero multiple of the page size)")]
    InvalidMemorySize(u32),

    #[error("invalid core count: {0} (must be > 0)")]
    InvalidCoreCount(u32),

    #[error("unknown device driver: {0}")]
    UnknownDriver(String),

    // Memory management errors
    #[error("invalid page: {0} is not allocated")]
    InvalidPage(u32),

    #[error("page {0} is already allocated")]
    PageInUse(u32),

    #[error("out of memory: no free page")]
    OutOfMemory,

    // Binary loading errors
    #[error("binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("malformed binary: {0}")]
    BinaryFormat(String),

    // Device errors
    #[error("device init failed: {device}: {reason}")]
    DeviceInit { device: String, reason: String },

    #[error("MMIO region overlap: 0x{base:08x}+0x{size:x} conflicts with device {existing}")]
    AddressConflict {
        base: u32,
        size: u32,
        existing: String,
    },

    #[error("I/O port overlap: 0x{port:04x} conflicts with device {existing}")]
    PortConflict { port: u16, existing: String },

    // Snapshot errors
    #[error("snapshot format error: {0}")]
    SnapshotFormat(String),

    // Runtime errors
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("fatal fault on core {core}: {fault}")]
    FatalFault { core: usize, fault: String },

    // Host I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_vectors() {
        assert_eq!(Fault::InvalidOpcode(0x3f).vector(), 0);
        assert_eq!(
            Fault::PageFault {
                addr: 0xDEAD_BEEF,
                kind: AccessKind::Read
            }
            .vector(),
            1
        );
        assert_eq!(Fault::DivisionByZero.vector(), 2);
        assert_eq!(
            Fault::AccessViolation {
                addr: 0,
                kind: AccessKind::Write
            }
            .vector(),
            3
        );
        assert_eq!(Fault::UnalignedAccess { addr: 1 }.vector(), 4);
        assert_eq!(Fault::DoubleFault.vector(), 5);
        assert_eq!(Fault::PrivilegeFault.vector(), 6);
        assert_eq!(Fault::InvalidIrq(99).vector(), 7);
    }

    #[test]
    fn test_fault_context_words() {
        let fault = Fault::PageFault {
            addr: 0xDEAD_BEEF,
            kind: AccessKind::Read,
        };
        assert_eq!(fault.context_addr(), 0xDEAD_BEEF);
        assert_eq!(fault.context_kind(), 0);

        let fault = Fault::AccessViolation {
            addr: 0x100,
            kind: AccessKind::Write,
        };
        assert_eq!(fault.context_kind(), 1);
    }
}
