//! TTY device.
//!
//! Output half of the terminal pair: bytes written to the data register
//! are forwarded to the attached host sink immediately. The device raises
//! no IRQ and keeps no guest-visible state.
//!
//! ## Register map
//!
//! | Offset | Name | Description |
//! |--------|------|-------------|
//! | 0x00   | DATA | write forwards the low byte to the output sink |

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, SharedWriter, Width};
use crate::error::{Fault, Result};

/// TTY frontend writing into a host sink.
pub struct Tty {
    name: String,
    output: SharedWriter,
}

impl Tty {
    pub const REG_DATA: u32 = 0x00;

    /// Create a TTY with no attached sink; bytes are dropped until a
    /// terminal (or `-g`) attaches one.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_output(name, Arc::new(Mutex::new(Box::new(io::sink()))))
    }

    pub fn with_output(name: impl Into<String>, output: SharedWriter) -> Self {
        Self {
            name: name.into(),
            output,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        Ok(Self::new(config.name.clone()))
    }

    fn put(&mut self, byte: u8) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.write_all(&[byte]);
            let _ = output.flush();
        }
    }
}

impl Device for Tty {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "tty"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Output
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
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault> {
        if offset == Self::REG_DATA {
            self.put((value & 0xFF) as u8);
        }
        Ok(())
    }

    fn io_write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _offset: u16,
        value: u8,
    ) -> std::result::Result<(), Fault> {
        self.put(value);
        Ok(())
    }

    fn attach_output(&mut self, writer: SharedWriter) {
        self.output = writer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryController;

    struct TestWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_data_writes_reach_sink() {
        let output = Arc::new(Mutex::new(Vec::new()));
        let writer = TestWriter {
            data: output.clone(),
        };
        let mut tty = Tty::with_output("tty0", Arc::new(Mutex::new(Box::new(writer))));

        let mut mem = MemoryController::new(0x1000, false).unwrap();
        let mut raised = Vec::new();
        let mut snapshot = false;
        let mut input = Vec::new();
        let mut ctx = DeviceContext {
            mem: &mut mem,
            raised: &mut raised,
            now: 0,
            snapshot_requested: &mut snapshot,
            input: &mut input,
        };

        tty.mmio_write(&mut ctx, Tty::REG_DATA, Width::Byte, b'H' as u32)
            .unwrap();
        tty.mmio_write(&mut ctx, Tty::REG_DATA, Width::Byte, b'i' as u32)
            .unwrap();
        tty.io_write(&mut ctx, 0, b'!').unwrap();

        assert_eq!(&*output.lock().unwrap(), b"Hi!");
    }
}
