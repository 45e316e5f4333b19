//! SVGA display device.
//!
//! A byte-per-cell framebuffer mapped behind the device's MMIO region.
//! Guests write cells directly; a refresh strobe renders the current
//! frame to the attached host sink (one line per row). Rendering is a
//! debugging aid for text-mode guests, not a graphics pipeline.
//!
//! ## Register map
//!
//! | Offset | Name    | Description |
//! |--------|---------|-------------|
//! | 0x00   | WIDTH   | columns (r) |
//! | 0x04   | HEIGHT  | rows (r) |
//! | 0x08   | REFRESH | write strobe: render the frame (w) |
//! | 0x100+ | FB      | framebuffer, row-major, one byte per cell |

use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, SharedWriter, Width};
use crate::error::{Fault, Result};

pub const DEFAULT_WIDTH: u32 = 80;
pub const DEFAULT_HEIGHT: u32 = 25;

/// Framebuffer display.
pub struct Svga {
    name: String,
    width: u32,
    height: u32,
    framebuffer: Vec<u8>,
    output: SharedWriter,
}

impl Svga {
    pub const REG_WIDTH: u32 = 0x00;
    pub const REG_HEIGHT: u32 = 0x04;
    pub const REG_REFRESH: u32 = 0x08;
    /// Framebuffer offset within the MMIO region.
    pub const FB_OFFSET: u32 = 0x100;

    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            framebuffer: vec![0; (width * height) as usize],
            output: Arc::new(Mutex::new(Box::new(io::sink()))),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let width = config.get_int("width").unwrap_or(DEFAULT_WIDTH as i64) as u32;
        let height = config.get_int("height").unwrap_or(DEFAULT_HEIGHT as i64) as u32;
        Ok(Self::new(config.name.clone(), width, height))
    }

    /// Size of the MMIO region this device needs.
    pub fn region_size(&self) -> u32 {
        Self::FB_OFFSET + self.width * self.height
    }

    fn render(&mut self) {
        let Ok(mut output) = self.output.lock() else {
            return;
        };

        for row in 0..self.height {
            let start = (row * self.width) as usize;
            let line: Vec<u8> = self.framebuffer[start..start + self.width as usize]
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b } else { b'.' })
                .collect();
            let _ = output.write_all(&line);
            let _ = output.write_all(b"\n");
        }
        let _ = output.flush();
    }
}

impl Device for Svga {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "svga"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Display
    }

    fn mmio_region_size(&self) -> u32 {
        self.region_size()
    }

    fn reset(&mut self) {
        self.framebuffer.fill(0);
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
    ) -> std::result::Result<u32, Fault> {
        let value = match offset {
            Self::REG_WIDTH => self.width,
            Self::REG_HEIGHT => self.height,
            fb if fb >= Self::FB_OFFSET => {
                let index = (fb - Self::FB_OFFSET) as usize;
                self.framebuffer.get(index).copied().unwrap_or(0) as u32
            }
            _ => 0,
        };
        Ok(value)
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault> {
        match offset {
            Self::REG_REFRESH => self.render(),
            fb if fb >= Self::FB_OFFSET => {
                let index = (fb - Self::FB_OFFSET) as usize;
                if let Some(cell) = self.framebuffer.get_mut(index) {
                    *cell = (value & 0xFF) as u8;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn attach_output(&mut self, writer: SharedWriter) {
        self.output = writer;
    }

    fn save_state(&self) -> serde_json::Value {
        json!({
            "width": self.width,
            "height": self.height,
            "framebuffer": self.framebuffer,
        })
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        if let Some(fb) = state["framebuffer"].as_array() {
            self.framebuffer = fb
                .iter()
                .filter_map(|v| v.as_u64())
                .map(|v| v as u8)
                .collect();
        }
        Ok(())
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

    fn with_context<R>(f: impl FnOnce(&mut DeviceContext<'_>) -> R) -> R {
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
        f(&mut ctx)
    }

    #[test]
    fn test_framebuffer_roundtrip() {
        let mut svga = Svga::new("vga0", 4, 2);

        with_context(|ctx| {
            assert_eq!(svga.mmio_read(ctx, Svga::REG_WIDTH, Width::Word).unwrap(), 4);
            assert_eq!(svga.mmio_read(ctx, Svga::REG_HEIGHT, Width::Word).unwrap(), 2);

            svga.mmio_write(ctx, Svga::FB_OFFSET + 5, Width::Byte, b'X' as u32)
                .unwrap();
            assert_eq!(
                svga.mmio_read(ctx, Svga::FB_OFFSET + 5, Width::Byte).unwrap(),
                b'X' as u32
            );
        });
    }

    #[test]
    fn test_refresh_renders_rows() {
        let output = Arc::new(Mutex::new(Vec::new()));
        let mut svga = Svga::new("vga0", 2, 2);
        svga.attach_output(Arc::new(Mutex::new(Box::new(TestWriter {
            data: output.clone(),
        }))));

        with_context(|ctx| {
            for (i, byte) in [b'a', b'b', b'c', b'd'].into_iter().enumerate() {
                svga.mmio_write(ctx, Svga::FB_OFFSET + i as u32, Width::Byte, byte as u32)
                    .unwrap();
            }
            svga.mmio_write(ctx, Svga::REG_REFRESH, Width::Word, 1).unwrap();
        });

        assert_eq!(&*output.lock().unwrap(), b"ab\ncd\n");
    }
}
