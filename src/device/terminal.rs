//! Terminal device.
//!
//! Host-side binding of the frontend pair: pumps bytes arriving from the
//! host (stdin, or a test feed) into a keyboard device and hands the
//! machine a stdout sink for the paired TTY. The terminal itself has no
//! guest-visible registers; it exists so the wiring shows up in the
//! configuration and the HDT.
//!
//! Configuration keys: `input` names the keyboard device to feed,
//! `output` names the TTY whose bytes should reach host stdout. The
//! machine resolves and validates both names at boot; the terminal
//! itself only carries the host plumbing.

use std::io::Read;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;

use log::{debug, warn};

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, Width};
use crate::error::{Fault, Result};

/// Stdin/stdout binding for a keyboard + TTY pair.
pub struct Terminal {
    name: String,
    sink_index: Option<usize>,
    rx: Receiver<u8>,
    tx: Sender<u8>,
    pump_started: bool,
}

impl Terminal {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = channel();
        Self {
            name: name.into(),
            sink_index: None,
            rx,
            tx,
            pump_started: false,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        // The wiring targets are resolved at boot; fail early when the
        // keys are missing entirely.
        config.require_str("input")?;
        config.require_str("output")?;
        Ok(Self::new(config.name.clone()))
    }

    /// Host-side feed used by tests and by the stdin pump.
    pub fn input_sender(&self) -> Sender<u8> {
        self.tx.clone()
    }

    /// Spawn the host stdin reader. Bytes become keyboard scancodes at
    /// the next scheduler round.
    pub fn start_stdin_pump(&mut self) {
        if self.pump_started {
            return;
        }
        self.pump_started = true;

        let tx = self.tx.clone();
        thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 64];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if tx.send(byte).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("terminal: stdin read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("terminal: stdin pump finished");
        });
    }
}

impl Device for Terminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "terminal"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Terminal
    }

    fn start(&mut self) {
        self.start_stdin_pump();
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
        _offset: u32,
        _width: Width,
        _value: u32,
    ) -> std::result::Result<(), Fault> {
        Ok(())
    }

    fn wire_input_sink(&mut self, index: usize) {
        self.sink_index = Some(index);
    }

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) {
        let Some(sink) = self.sink_index else {
            return;
        };

        loop {
            match self.rx.try_recv() {
                Ok(byte) => ctx.input.push((sink, byte)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryController;

    #[test]
    fn test_tick_routes_host_bytes_to_sink() {
        let mut term = Terminal::new("term0");
        term.wire_input_sink(3);
        let feed = term.input_sender();
        feed.send(b'x').unwrap();
        feed.send(b'y').unwrap();

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
        term.tick(&mut ctx);

        assert_eq!(input, vec![(3, b'x'), (3, b'y')]);
    }

    #[test]
    fn test_unwired_terminal_drops_nothing() {
        let mut term = Terminal::new("term0");
        let feed = term.input_sender();
        feed.send(b'x').unwrap();

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
        term.tick(&mut ctx);

        // Byte stays queued until the sink is wired.
        assert!(ctx.input.is_empty());
        term.wire_input_sink(0);
        term.tick(&mut ctx);
        assert_eq!(ctx.input, &vec![(0, b'x')]);
    }

    #[test]
    fn test_from_config_requires_wiring_keys() {
        let mut config = crate::config::DeviceConfig::for_tests("term0", "terminal", "terminal");
        assert!(Terminal::from_config(&config).is_err());

        config.options.insert(
            "input".to_string(),
            toml::Value::String("kbd0".to_string()),
        );
        config.options.insert(
            "output".to_string(),
            toml::Value::String("tty0".to_string()),
        );
        assert!(Terminal::from_config(&config).is_ok());
    }
}
