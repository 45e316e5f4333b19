//! Keyboard device.
//!
//! Frontend of the terminal pair: the host side enqueues scancodes, the
//! guest drains them one byte at a time through a status/data register
//! pair. An IRQ is raised when the queue becomes non-empty.
//!
//! ## Register map
//!
//! | Offset | Name   | Description |
//! |--------|--------|-------------|
//! | 0x00   | STATUS | bit 0: data available |
//! | 0x04   | DATA   | pops one byte; 0xFF when the queue is empty |
//!
//! The same pop is reachable through the device's I/O-port window
//! (CONIO_STDIN).

use std::collections::VecDeque;

use log::debug;
use serde_json::json;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, Width};
use crate::error::{Fault, Result};

/// Value returned by DATA when no input is queued.
pub const NO_INPUT: u8 = 0xFF;

/// Default IRQ line (first device vector).
pub const DEFAULT_IRQ: u32 = crate::irq::IRQ_BASE;

/// Keyboard controller with a host-fed scancode queue.
pub struct Keyboard {
    name: String,
    irq: u32,
    queue: VecDeque<u8>,
}

impl Keyboard {
    pub const REG_STATUS: u32 = 0x00;
    pub const REG_DATA: u32 = 0x04;

    pub fn new(name: impl Into<String>, irq: u32) -> Self {
        Self {
            name: name.into(),
            irq,
            queue: VecDeque::new(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        Ok(Self::new(
            config.name.clone(),
            config.irq.unwrap_or(DEFAULT_IRQ),
        ))
    }

    /// Queue host input. Returns true when the queue was empty before,
    /// i.e. the caller should see an IRQ.
    pub fn enqueue(&mut self, byte: u8) -> bool {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(byte);
        was_empty
    }

    fn pop(&mut self) -> u8 {
        match self.queue.pop_front() {
            Some(byte) => byte,
            None => {
                debug!("keyboard {}: empty queue, signalling downstream", self.name);
                NO_INPUT
            }
        }
    }
}

impl Device for Keyboard {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "keyboard"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Input
    }

    fn irq(&self) -> Option<u32> {
        Some(self.irq)
    }

    fn reset(&mut self) {
        self.queue.clear();
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
    ) -> std::result::Result<u32, Fault> {
        match offset {
            Self::REG_STATUS => Ok(u32::from(!self.queue.is_empty())),
            Self::REG_DATA => Ok(self.pop() as u32),
            _ => Ok(0),
        }
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _offset: u32,
        _width: Width,
        _value: u32,
    ) -> std::result::Result<(), Fault> {
        // All registers are read-only.
        Ok(())
    }

    fn io_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _offset: u16,
    ) -> std::result::Result<u8, Fault> {
        Ok(self.pop())
    }

    fn receive_input(&mut self, ctx: &mut DeviceContext<'_>, byte: u8) {
        if self.enqueue(byte) {
            ctx.raised.push(self.irq);
        }
    }

    fn save_state(&self) -> serde_json::Value {
        json!({
            "irq": self.irq,
            "queue": self.queue.iter().copied().collect::<Vec<u8>>(),
        })
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        self.queue = state["queue"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as u8).collect())
            .unwrap_or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryController;

    fn with_context<R>(f: impl FnOnce(&mut DeviceContext<'_>) -> R) -> (R, Vec<u32>) {
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
        let result = f(&mut ctx);
        (result, raised)
    }

    #[test]
    fn test_reads_drain_one_byte() {
        let mut kbd = Keyboard::new("kbd0", 8);
        kbd.enqueue(b'h');
        kbd.enqueue(b'i');

        let ((), _) = with_context(|ctx| {
            assert_eq!(kbd.mmio_read(ctx, Keyboard::REG_STATUS, Width::Byte).unwrap(), 1);
            assert_eq!(kbd.mmio_read(ctx, Keyboard::REG_DATA, Width::Byte).unwrap(), b'h' as u32);
            assert_eq!(kbd.mmio_read(ctx, Keyboard::REG_DATA, Width::Byte).unwrap(), b'i' as u32);
            assert_eq!(kbd.mmio_read(ctx, Keyboard::REG_STATUS, Width::Byte).unwrap(), 0);
            assert_eq!(
                kbd.mmio_read(ctx, Keyboard::REG_DATA, Width::Byte).unwrap(),
                NO_INPUT as u32
            );
        });
    }

    #[test]
    fn test_irq_raised_on_empty_to_nonempty() {
        let mut kbd = Keyboard::new("kbd0", 9);

        let ((), raised) = with_context(|ctx| {
            kbd.receive_input(ctx, b'a');
            kbd.receive_input(ctx, b'b');
        });

        // Second byte must not raise again while the queue is non-empty.
        assert_eq!(raised, vec![9]);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut kbd = Keyboard::new("kbd0", 8);
        kbd.enqueue(1);
        kbd.enqueue(2);

        let state = kbd.save_state();
        let mut restored = Keyboard::new("kbd0", 8);
        restored.load_state(&state).unwrap();

        let ((), _) = with_context(|ctx| {
            assert_eq!(restored.mmio_read(ctx, Keyboard::REG_DATA, Width::Byte).unwrap(), 1);
            assert_eq!(restored.mmio_read(ctx, Keyboard::REG_DATA, Width::Byte).unwrap(), 2);
        });
    }
}
