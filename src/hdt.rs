//! Hardware Description Table.
//!
//! The HDT is a tagged-record blob placed in guest-visible memory during
//! boot; guests find its base address in `r0` at entry. Layout:
//!
//! ```text
//! header  { magic: u32, entries: u32, length: u32 }
//! entry   { type: u16, length: u16, payload... }
//! ```
//!
//! `length` fields include the headers themselves; the header `length`
//! is the total blob size. Entry types: CPU (0), MEMORY (1), ARGUMENT
//! (2), DEVICE (3). Device entries appear in configuration order and
//! carry an MMIO/IRQ tail so guests can locate their registers without
//! probing.

use crate::error::{Error, Result};

/// HDT magic value.
pub const MAGIC: u32 = 0x4D5E_6F7A;

/// Size of the blob header in bytes.
pub const HEADER_SIZE: u32 = 12;

/// Entry type tags.
pub mod entry_type {
    pub const CPU: u16 = 0;
    pub const MEMORY: u16 = 1;
    pub const ARGUMENT: u16 = 2;
    pub const DEVICE: u16 = 3;
}

/// Maximum device name length in a DEVICE entry.
pub const DEVICE_NAME_LEN: usize = 10;
/// Maximum identifier length in a DEVICE entry.
pub const DEVICE_IDENT_LEN: usize = 32;
/// Name/value length in an ARGUMENT entry.
pub const ARGUMENT_FIELD_LEN: usize = 16;

/// IRQ tail value meaning "no IRQ assigned".
pub const NO_IRQ: u32 = 0xFFFF_FFFF;

/// A parsed HDT entry (guest-side view, used by tests and tooling).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Cpu {
        cores: u16,
        cores_per_cpu: u16,
    },
    Memory {
        size: u32,
    },
    Argument {
        name: String,
        value: String,
    },
    Device {
        name: String,
        flags: u16,
        ident: String,
        /// Device-specific tail: (mmio base, mmio size, irq).
        mmio_base: u32,
        mmio_size: u32,
        irq: u32,
    },
}

fn fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Builds the HDT blob during boot.
#[derive(Default)]
pub struct HdtBuilder {
    entries: Vec<Vec<u8>>,
}

impl HdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: u16, payload: &[u8]) {
        let mut entry = Vec::with_capacity(4 + payload.len());
        entry.extend_from_slice(&kind.to_le_bytes());
        entry.extend_from_slice(&((4 + payload.len()) as u16).to_le_bytes());
        entry.extend_from_slice(payload);
        self.entries.push(entry);
    }

    pub fn cpu(mut self, cores: u16, cores_per_cpu: u16) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&cores.to_le_bytes());
        payload.extend_from_slice(&cores_per_cpu.to_le_bytes());
        self.push(entry_type::CPU, &payload);
        self
    }

    pub fn memory(mut self, size: u32) -> Self {
        self.push(entry_type::MEMORY, &size.to_le_bytes());
        self
    }

    pub fn argument(mut self, name: &str, value: &str) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&fixed::<ARGUMENT_FIELD_LEN>(name));
        payload.extend_from_slice(&fixed::<ARGUMENT_FIELD_LEN>(value));
        self.push(entry_type::ARGUMENT, &payload);
        self
    }

    pub fn device(
        mut self,
        name: &str,
        flags: u16,
        ident: &str,
        mmio_base: u32,
        mmio_size: u32,
        irq: Option<u32>,
    ) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&fixed::<DEVICE_NAME_LEN>(name));
        payload.extend_from_slice(&flags.to_le_bytes());
        payload.extend_from_slice(&fixed::<DEVICE_IDENT_LEN>(ident));
        payload.extend_from_slice(&mmio_base.to_le_bytes());
        payload.extend_from_slice(&mmio_size.to_le_bytes());
        payload.extend_from_slice(&irq.unwrap_or(NO_IRQ).to_le_bytes());
        self.push(entry_type::DEVICE, &payload);
        self
    }

    /// Serialize the blob: header, then entries in insertion order.
    pub fn build(self) -> Vec<u8> {
        let length: u32 = HEADER_SIZE + self.entries.iter().map(|e| e.len() as u32).sum::<u32>();

        let mut out = Vec::with_capacity(length as usize);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        for entry in self.entries {
            out.extend_from_slice(&entry);
        }
        out
    }
}

/// Parse an HDT blob. Validates the magic, the entry count, and the
/// total length.
pub fn parse(bytes: &[u8]) -> Result<Vec<Entry>> {
    if bytes.len() < HEADER_SIZE as usize {
        return Err(Error::InvariantViolation("HDT shorter than header".into()));
    }

    let magic = read_u32(bytes, 0);
    if magic != MAGIC {
        return Err(Error::InvariantViolation(format!(
            "HDT magic mismatch: 0x{:08x}",
            magic
        )));
    }

    let count = read_u32(bytes, 4) as usize;
    let length = read_u32(bytes, 8) as usize;
    if length > bytes.len() {
        return Err(Error::InvariantViolation("HDT length exceeds blob".into()));
    }

    let mut entries = Vec::with_capacity(count);
    let mut at = HEADER_SIZE as usize;

    for _ in 0..count {
        if at + 4 > length {
            return Err(Error::InvariantViolation("HDT entry count mismatch".into()));
        }
        let kind = read_u16(bytes, at);
        let entry_len = read_u16(bytes, at + 2) as usize;
        if entry_len < 4 || at + entry_len > length {
            return Err(Error::InvariantViolation("HDT entry overruns blob".into()));
        }
        let payload = &bytes[at + 4..at + entry_len];

        let entry = match kind {
            entry_type::CPU => Entry::Cpu {
                cores: read_u16(payload, 0),
                cores_per_cpu: read_u16(payload, 2),
            },
            entry_type::MEMORY => Entry::Memory {
                size: read_u32(payload, 0),
            },
            entry_type::ARGUMENT => Entry::Argument {
                name: fixed_str(&payload[..ARGUMENT_FIELD_LEN]),
                value: fixed_str(&payload[ARGUMENT_FIELD_LEN..2 * ARGUMENT_FIELD_LEN]),
            },
            entry_type::DEVICE => {
                let ident_at = DEVICE_NAME_LEN + 2;
                let tail_at = ident_at + DEVICE_IDENT_LEN;
                Entry::Device {
                    name: fixed_str(&payload[..DEVICE_NAME_LEN]),
                    flags: read_u16(payload, DEVICE_NAME_LEN),
                    ident: fixed_str(&payload[ident_at..tail_at]),
                    mmio_base: read_u32(payload, tail_at),
                    mmio_size: read_u32(payload, tail_at + 4),
                    irq: read_u32(payload, tail_at + 8),
                }
            }
            other => {
                return Err(Error::InvariantViolation(format!(
                    "unknown HDT entry type {}",
                    other
                )))
            }
        };
        entries.push(entry);
        at += entry_len;
    }

    if at != length {
        return Err(Error::InvariantViolation(
            "HDT length does not match entries".into(),
        ));
    }

    Ok(entries)
}
