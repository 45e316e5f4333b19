//! Device bus: MMIO and I/O-port routing.
//!
//! The bus owns every device instance and two ordered region tables. An
//! MMIO access is routed to the unique region containing the address and
//! dispatched to the owning device with the in-region offset; an address
//! in no region traps back to the core as an MMIO fault. Region overlap
//! is rejected at registration time, as is any region that intersects
//! the RAM window.

use log::{debug, warn};

use crate::device::{Device, DeviceContext, Width};
use crate::error::{AccessKind, Error, Fault, Result};

#[derive(Debug, Clone, Copy)]
struct MmioRegion {
    base: u32,
    size: u32,
    device: usize,
}

#[derive(Debug, Clone, Copy)]
struct PortRegion {
    base: u16,
    count: u16,
    device: usize,
}

/// Registry of devices plus the address routing tables.
pub struct DeviceBus {
    ram_size: u32,
    devices: Vec<Box<dyn Device>>,
    mmio: Vec<MmioRegion>,
    ports: Vec<PortRegion>,
}

impl DeviceBus {
    pub fn new(ram_size: u32) -> Self {
        Self {
            ram_size,
            devices: Vec::new(),
            mmio: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Register a device with an optional MMIO region and an optional
    /// I/O-port window. Returns the device index used for routing.
    pub fn register(
        &mut self,
        device: Box<dyn Device>,
        mmio: Option<(u32, u32)>,
        ports: Option<(u16, u16)>,
    ) -> Result<usize> {
        let index = self.devices.len();

        if let Some((base, size)) = mmio {
            if size == 0 {
                return Err(Error::Configuration(format!(
                    "device {}: empty MMIO region",
                    device.name()
                )));
            }
            if base < self.ram_size {
                return Err(Error::Configuration(format!(
                    "device {}: MMIO region 0x{:08x} overlaps RAM (size 0x{:x})",
                    device.name(),
                    base,
                    self.ram_size
                )));
            }
            if let Some(region) = self
                .mmio
                .iter()
                .find(|r| (base as u64) < r.base as u64 + r.size as u64
                    && (r.base as u64) < base as u64 + size as u64)
            {
                return Err(Error::AddressConflict {
                    base,
                    size,
                    existing: self.devices[region.device].name().to_string(),
                });
            }

            self.mmio.push(MmioRegion {
                base,
                size,
                device: index,
            });
            self.mmio.sort_by_key(|r| r.base);
        }

        if let Some((base, count)) = ports {
            if let Some(region) = self
                .ports
                .iter()
                .find(|r| (base as u32) < r.base as u32 + r.count as u32
                    && (r.base as u32) < base as u32 + count as u32)
            {
                return Err(Error::PortConflict {
                    port: base,
                    existing: self.devices[region.device].name().to_string(),
                });
            }

            self.ports.push(PortRegion {
                base,
                count,
                device: index,
            });
            self.ports.sort_by_key(|r| r.base);
        }

        debug!(
            "bus.register: device={}, driver={}, mmio={:?}, ports={:?}",
            device.name(),
            device.driver(),
            mmio,
            ports
        );

        self.devices.push(device);
        Ok(index)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Option<&dyn Device> {
        self.devices.get(index).map(|d| d.as_ref())
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut Box<dyn Device>> {
        self.devices.get_mut(index)
    }

    pub fn device_index_by_name(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name() == name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &dyn Device> {
        self.devices.iter().map(|d| d.as_ref())
    }

    /// MMIO routing metadata for a device index (HDT construction).
    pub fn mmio_region_of(&self, index: usize) -> Option<(u32, u32)> {
        self.mmio
            .iter()
            .find(|r| r.device == index)
            .map(|r| (r.base, r.size))
    }

    /// Find the unique region containing `addr`.
    fn route(&self, addr: u32) -> Option<(usize, u32)> {
        self.mmio
            .iter()
            .find(|r| addr >= r.base && addr - r.base < r.size)
            .map(|r| (r.device, addr - r.base))
    }

    fn route_port(&self, port: u16) -> Option<(usize, u16)> {
        self.ports
            .iter()
            .find(|r| port >= r.base && port - r.base < r.count)
            .map(|r| (r.device, port - r.base))
    }

    /// True when some device claims `addr`.
    pub fn claims(&self, addr: u32) -> bool {
        self.route(addr).is_some()
    }

    pub fn mmio_read(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        addr: u32,
        width: Width,
    ) -> std::result::Result<u32, Fault> {
        let (index, offset) = self.route(addr).ok_or(Fault::MmioFault {
            addr,
            kind: AccessKind::Read,
        })?;
        self.devices[index].mmio_read(ctx, offset, width)
    }

    pub fn mmio_write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        addr: u32,
        width: Width,
        value: u32,
    ) -> std::result::Result<(), Fault> {
        let (index, offset) = self.route(addr).ok_or(Fault::MmioFault {
            addr,
            kind: AccessKind::Write,
        })?;
        self.devices[index].mmio_write(ctx, offset, width, value)
    }

    pub fn io_read(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        port: u16,
    ) -> std::result::Result<u8, Fault> {
        let (index, offset) = self.route_port(port).ok_or(Fault::MmioFault {
            addr: port as u32,
            kind: AccessKind::Read,
        })?;
        self.devices[index].io_read(ctx, offset)
    }

    pub fn io_write(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        port: u16,
        value: u8,
    ) -> std::result::Result<(), Fault> {
        let (index, offset) = self.route_port(port).ok_or(Fault::MmioFault {
            addr: port as u32,
            kind: AccessKind::Write,
        })?;
        self.devices[index].io_write(ctx, offset, value)
    }

    /// Run every device's timed callback, then route any host input the
    /// callbacks produced.
    pub fn tick(&mut self, ctx: &mut DeviceContext<'_>) {
        for device in &mut self.devices {
            device.tick(ctx);
        }
        self.route_input(ctx);
    }

    /// Deliver queued host input bytes to their target devices.
    pub fn route_input(&mut self, ctx: &mut DeviceContext<'_>) {
        while !ctx.input.is_empty() {
            let batch: Vec<(usize, u8)> = ctx.input.drain(..).collect();
            for (index, byte) in batch {
                match self.devices.get_mut(index) {
                    Some(device) => device.receive_input(ctx, byte),
                    None => warn!("bus.route_input: no device at index {}", index),
                }
            }
        }
    }

    /// Start host-side plumbing (reader threads) on every device.
    pub fn start(&mut self) {
        for device in &mut self.devices {
            device.start();
        }
    }

    /// Reset every device.
    pub fn reset(&mut self) {
        for device in &mut self.devices {
            device.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::{self, Keyboard};
    use crate::memory::MemoryController;

    fn context<'a>(
        mem: &'a mut MemoryController,
        raised: &'a mut Vec<u32>,
        snapshot: &'a mut bool,
        input: &'a mut Vec<(usize, u8)>,
    ) -> DeviceContext<'a> {
        DeviceContext {
            mem,
            raised,
            now: 0,
            snapshot_requested: snapshot,
            input,
        }
    }

    fn keyboard(name: &str) -> Box<dyn Device> {
        device::create(&DeviceConfig::for_tests(name, "input", "keyboard")).unwrap()
    }

    #[test]
    fn test_register_rejects_overlap() {
        let mut bus = DeviceBus::new(0x1000);
        bus.register(keyboard("kbd0"), Some((0x2000, 0x100)), None)
            .unwrap();

        let err = bus
            .register(keyboard("kbd1"), Some((0x2080, 0x100)), None)
            .unwrap_err();
        assert!(matches!(err, Error::AddressConflict { existing, .. } if existing == "kbd0"));

        // Adjacent region is fine.
        bus.register(keyboard("kbd2"), Some((0x2100, 0x100)), None)
            .unwrap();
    }

    #[test]
    fn test_register_rejects_ram_overlap() {
        let mut bus = DeviceBus::new(0x10_0000);
        assert!(bus
            .register(keyboard("kbd0"), Some((0x8000, 0x100)), None)
            .is_err());
    }

    #[test]
    fn test_route_finds_unique_region() {
        let mut bus = DeviceBus::new(0x1000);
        let a = bus
            .register(keyboard("kbd0"), Some((0x2000, 0x100)), None)
            .unwrap();
        let b = bus
            .register(keyboard("kbd1"), Some((0x3000, 0x100)), None)
            .unwrap();

        assert_eq!(bus.route(0x2000), Some((a, 0)));
        assert_eq!(bus.route(0x20FF), Some((a, 0xFF)));
        assert_eq!(bus.route(0x3004), Some((b, 4)));
        assert_eq!(bus.route(0x2100), None);
        assert_eq!(bus.route(0x0), None);
    }

    #[test]
    fn test_unrouted_access_is_mmio_fault() {
        let mut bus = DeviceBus::new(0x1000);
        let mut mem = MemoryController::new(0x1000, false).unwrap();
        let mut raised = Vec::new();
        let mut snapshot = false;
        let mut input = Vec::new();
        let mut ctx = context(&mut mem, &mut raised, &mut snapshot, &mut input);

        assert!(matches!(
            bus.mmio_read(&mut ctx, 0x5000, Width::Word),
            Err(Fault::MmioFault { addr: 0x5000, .. })
        ));
        assert!(matches!(
            bus.mmio_write(&mut ctx, 0x5000, Width::Word, 1),
            Err(Fault::MmioFault { .. })
        ));
    }

    #[test]
    fn test_input_routing_reaches_device() {
        let mut bus = DeviceBus::new(0x1000);
        let index = bus
            .register(keyboard("kbd0"), Some((0x2000, 0x100)), None)
            .unwrap();

        let mut mem = MemoryController::new(0x1000, false).unwrap();
        let mut raised = Vec::new();
        let mut snapshot = false;
        let mut input = vec![(index, b'A')];
        let mut ctx = context(&mut mem, &mut raised, &mut snapshot, &mut input);

        bus.route_input(&mut ctx);

        // DATA register returns the queued byte.
        let value = bus
            .mmio_read(&mut ctx, 0x2000 + Keyboard::REG_DATA, Width::Byte)
            .unwrap();
        assert_eq!(value, b'A' as u32);
    }
}
