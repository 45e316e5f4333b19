//! Block storage device.
//!
//! File-backed storage addressed in 512-byte blocks. The guest programs
//! block index, block count, and a physical buffer address, then kicks a
//! command; the transfer runs synchronously (DMA through the memory
//! controller) and the completion IRQ is raised before the write returns.
//! Host I/O failures set the error bit and are logged; they never abort
//! the machine.
//!
//! ## Register map
//!
//! | Offset | Name   | Description |
//! |--------|--------|-------------|
//! | 0x00   | BLOCK  | first block index (r/w) |
//! | 0x04   | COUNT  | number of blocks (r/w) |
//! | 0x08   | BUFFER | physical buffer address (r/w) |
//! | 0x0C   | CMD    | 1 = read, 2 = write (w) |
//! | 0x10   | STATUS | bit 0: done, bit 1: error (r) |

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, error};
use serde_json::json;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, Width};
use crate::error::{Error, Fault, Result};

/// Bytes per block.
pub const BLOCK_SIZE: u32 = 512;

/// Default IRQ line.
pub const DEFAULT_IRQ: u32 = crate::irq::IRQ_BASE + 2;

mod cmd {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
}

mod status {
    pub const DONE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
}

/// File-backed block storage.
pub struct BlockIo {
    name: String,
    irq: u32,
    path: PathBuf,
    file: Option<File>,
    readonly: bool,
    block: u32,
    count: u32,
    buffer: u32,
    status: u32,
}

impl BlockIo {
    pub const REG_BLOCK: u32 = 0x00;
    pub const REG_COUNT: u32 = 0x04;
    pub const REG_BUFFER: u32 = 0x08;
    pub const REG_CMD: u32 = 0x0C;
    pub const REG_STATUS: u32 = 0x10;

    pub fn new(name: impl Into<String>, irq: u32, path: impl Into<PathBuf>, readonly: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(&path)
            .map_err(|e| Error::DeviceInit {
                device: path.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: name.into(),
            irq,
            path,
            file: Some(file),
            readonly,
            block: 0,
            count: 0,
            buffer: 0,
            status: 0,
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let path = config.require_str("file")?.to_string();
        Self::new(
            config.name.clone(),
            config.irq.unwrap_or(DEFAULT_IRQ),
            path,
            config.get_bool("readonly").unwrap_or(false),
        )
    }

    fn execute(&mut self, ctx: &mut DeviceContext<'_>, command: u32) {
        debug!(
            "blockio {}: cmd={}, block={}, count={}, buffer=0x{:08x}",
            self.name, command, self.block, self.count, self.buffer
        );

        let outcome = match command {
            cmd::READ => self.do_read(ctx),
            cmd::WRITE => self.do_write(ctx),
            _ => Err(format!("unknown command {}", command)),
        };

        self.status = match outcome {
            Ok(()) => status::DONE,
            Err(reason) => {
                error!("blockio {}: {}", self.name, reason);
                status::DONE | status::ERROR
            }
        };

        ctx.raised.push(self.irq);
    }

    /// Transfer size in bytes, bounded by physical memory. The count
    /// register is guest-controlled, so the multiply stays in u64 and an
    /// oversized request becomes an error status, never a wrap.
    fn transfer_size(&self, ctx: &DeviceContext<'_>) -> std::result::Result<u32, String> {
        let bytes = self.count as u64 * BLOCK_SIZE as u64;
        if bytes > ctx.mem.size() as u64 {
            return Err(format!(
                "transfer of {} blocks exceeds memory ({} bytes)",
                self.count,
                ctx.mem.size()
            ));
        }
        Ok(bytes as u32)
    }

    fn do_read(&mut self, ctx: &mut DeviceContext<'_>) -> std::result::Result<(), String> {
        let bytes = self.transfer_size(ctx)?;
        let file = self.file.as_mut().ok_or("no backing file")?;

        file.seek(SeekFrom::Start(self.block as u64 * BLOCK_SIZE as u64))
            .map_err(|e| e.to_string())?;

        let mut data = vec![0u8; bytes as usize];
        file.read_exact(&mut data).map_err(|e| e.to_string())?;

        for (i, &byte) in data.iter().enumerate() {
            ctx.mem
                .write_u8(self.buffer + i as u32, byte)
                .map_err(|f| f.to_string())?;
        }
        Ok(())
    }

    fn do_write(&mut self, ctx: &mut DeviceContext<'_>) -> std::result::Result<(), String> {
        if self.readonly {
            return Err("device is read-only".to_string());
        }
        let bytes = self.transfer_size(ctx)?;

        let data = ctx
            .mem
            .read_bytes(self.buffer, bytes)
            .map_err(|f| f.to_string())?;

        let file = self.file.as_mut().ok_or("no backing file")?;
        file.seek(SeekFrom::Start(self.block as u64 * BLOCK_SIZE as u64))
            .map_err(|e| e.to_string())?;
        file.write_all(&data).map_err(|e| e.to_string())?;
        file.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl Device for BlockIo {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "blockio"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Storage
    }

    fn irq(&self) -> Option<u32> {
        Some(self.irq)
    }

    fn reset(&mut self) {
        self.block = 0;
        self.count = 0;
        self.buffer = 0;
        self.status = 0;
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
    ) -> std::result::Result<u32, Fault> {
        let value = match offset {
            Self::REG_BLOCK => self.block,
            Self::REG_COUNT => self.count,
            Self::REG_BUFFER => self.buffer,
            Self::REG_STATUS => self.status,
            _ => 0,
        };
        Ok(value)
    }

    fn mmio_write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault> {
        match offset {
            Self::REG_BLOCK => self.block = value,
            Self::REG_COUNT => self.count = value,
            Self::REG_BUFFER => self.buffer = value,
            Self::REG_CMD => self.execute(ctx, value),
            _ => {}
        }
        Ok(())
    }

    fn save_state(&self) -> serde_json::Value {
        json!({
            "path": self.path.display().to_string(),
            "block": self.block,
            "count": self.count,
            "buffer": self.buffer,
            "status": self.status,
        })
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        let get = |key: &str| state[key].as_u64().unwrap_or(0) as u32;
        self.block = get("block");
        self.count = get("count");
        self.buffer = get("buffer");
        self.status = get("status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryController;

    fn scratch_file(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ducky-blockio-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn run<R>(dev: &mut BlockIo, mem: &mut MemoryController, f: impl FnOnce(&mut BlockIo, &mut DeviceContext<'_>) -> R) -> (R, Vec<u32>) {
        let mut raised = Vec::new();
        let mut snapshot = false;
        let mut input = Vec::new();
        let mut ctx = DeviceContext {
            mem,
            raised: &mut raised,
            now: 0,
            snapshot_requested: &mut snapshot,
            input: &mut input,
        };
        let result = f(dev, &mut ctx);
        (result, raised)
    }

    #[test]
    fn test_read_block_into_memory() {
        let mut content = vec![0u8; BLOCK_SIZE as usize * 2];
        content[BLOCK_SIZE as usize] = 0xAB;
        content[BLOCK_SIZE as usize + 1] = 0xCD;
        let path = scratch_file("read", &content);

        let mut dev = BlockIo::new("disk0", 10, &path, false).unwrap();
        let mut mem = MemoryController::new(0x1_0000, false).unwrap();
        mem.alloc_area(0x800, BLOCK_SIZE).unwrap();

        let ((), raised) = run(&mut dev, &mut mem, |dev, ctx| {
            dev.mmio_write(ctx, BlockIo::REG_BLOCK, Width::Word, 1).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_COUNT, Width::Word, 1).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_BUFFER, Width::Word, 0x800).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_CMD, Width::Word, 1).unwrap();
        });

        assert_eq!(raised, vec![10]);
        assert_eq!(dev.status, 1);
        assert_eq!(mem.read_u8(0x800).unwrap(), 0xAB);
        assert_eq!(mem.read_u8(0x801).unwrap(), 0xCD);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_write_block_from_memory() {
        let path = scratch_file("write", &vec![0u8; BLOCK_SIZE as usize]);

        let mut dev = BlockIo::new("disk0", 10, &path, false).unwrap();
        let mut mem = MemoryController::new(0x1_0000, false).unwrap();
        mem.alloc_area(0x800, BLOCK_SIZE).unwrap();
        mem.write_u8(0x800, 0x5A).unwrap();

        let ((), raised) = run(&mut dev, &mut mem, |dev, ctx| {
            dev.mmio_write(ctx, BlockIo::REG_BLOCK, Width::Word, 0).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_COUNT, Width::Word, 1).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_BUFFER, Width::Word, 0x800).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_CMD, Width::Word, 2).unwrap();
        });

        assert_eq!(raised, vec![10]);
        assert_eq!(dev.status, 1);
        assert_eq!(std::fs::read(&path).unwrap()[0], 0x5A);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_out_of_range_read_sets_error_bit() {
        let path = scratch_file("short", &[0u8; 16]);

        let mut dev = BlockIo::new("disk0", 10, &path, false).unwrap();
        let mut mem = MemoryController::new(0x1_0000, false).unwrap();
        mem.alloc_area(0x800, BLOCK_SIZE).unwrap();

        let ((), raised) = run(&mut dev, &mut mem, |dev, ctx| {
            dev.mmio_write(ctx, BlockIo::REG_BLOCK, Width::Word, 5).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_COUNT, Width::Word, 1).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_BUFFER, Width::Word, 0x800).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_CMD, Width::Word, 1).unwrap();
        });

        // Completion IRQ fires either way; the error bit tells the guest.
        assert_eq!(raised, vec![10]);
        assert_eq!(dev.status, 3);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_oversized_count_sets_error_bit() {
        let path = scratch_file("huge", &vec![0u8; BLOCK_SIZE as usize]);

        let mut dev = BlockIo::new("disk0", 10, &path, false).unwrap();
        let mut mem = MemoryController::new(0x1_0000, false).unwrap();
        mem.alloc_area(0x800, BLOCK_SIZE).unwrap();

        // A count whose byte size overflows u32 must demote to the error
        // bit on both commands, not wrap the size computation.
        for command in [1, 2] {
            let ((), raised) = run(&mut dev, &mut mem, |dev, ctx| {
                dev.mmio_write(ctx, BlockIo::REG_BLOCK, Width::Word, 0).unwrap();
                dev.mmio_write(ctx, BlockIo::REG_COUNT, Width::Word, 0xFFFF_FFFF).unwrap();
                dev.mmio_write(ctx, BlockIo::REG_BUFFER, Width::Word, 0x800).unwrap();
                dev.mmio_write(ctx, BlockIo::REG_CMD, Width::Word, command).unwrap();
            });

            assert_eq!(raised, vec![10]);
            assert_eq!(dev.status, 3);
        }

        // The backing file was never touched.
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; BLOCK_SIZE as usize]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_readonly_write_rejected() {
        let path = scratch_file("ro", &vec![0u8; BLOCK_SIZE as usize]);

        let mut dev = BlockIo::new("disk0", 10, &path, true).unwrap();
        let mut mem = MemoryController::new(0x1_0000, false).unwrap();
        mem.alloc_area(0x800, BLOCK_SIZE).unwrap();

        let ((), _) = run(&mut dev, &mut mem, |dev, ctx| {
            dev.mmio_write(ctx, BlockIo::REG_COUNT, Width::Word, 1).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_BUFFER, Width::Word, 0x800).unwrap();
            dev.mmio_write(ctx, BlockIo::REG_CMD, Width::Word, 2).unwrap();
        });

        assert_eq!(dev.status, 3);

        std::fs::remove_file(path).ok();
    }
}
