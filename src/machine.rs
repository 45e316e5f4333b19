//! The machine: top-level orchestrator.
//!
//! Owns the cores, physical memory, and the device bus; drives the
//! cooperative scheduling tick (one instruction per live core per round,
//! then the devices' timed callbacks); implements the boot protocol that
//! loads binaries, builds the HDT, and hands its address to guests in
//! `r0`.
//!
//! Scheduling is single-threaded and deterministic: device side effects,
//! interrupt delivery, and memory visibility are reproducible run to
//! run, which is what makes snapshot/restore parity possible.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bus::DeviceBus;
use crate::config::MachineConfig;
use crate::cpu::isa::Reg;
use crate::cpu::{Core, ExecCtx, StepResult};
use crate::device::{self, DeviceClass, DeviceContext, SharedWriter};
use crate::error::{Error, Result};
use crate::hdt::HdtBuilder;
use crate::irq::{IVT_ENTRIES, IVT_ENTRY_SIZE};
use crate::loader::{self, LoadedBinary, Object};
use crate::memory::MemoryController;
use crate::snapshot::{DeviceState, MachineState, MemoryState};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineExit {
    /// All cores stopped; carries the aggregate exit code.
    Halted(u32),
    /// Instruction or wall-clock budget exceeded.
    Timeout,
}

/// A configured virtual machine.
pub struct Machine {
    config: MachineConfig,
    pub cores: Vec<Core>,
    pub mem: MemoryController,
    pub bus: DeviceBus,
    binaries: Vec<LoadedBinary>,
    ticks: u64,
    booted: bool,
    /// Set from outside (host signal handler); drained at boundaries.
    snapshot_flag: Arc<AtomicBool>,
    snapshot_path: Option<PathBuf>,
    extra_binaries: Vec<PathBuf>,
    guest_stdout: bool,
    interactive: bool,
}

impl Machine {
    /// Construct memory, bus, devices, and cores from a configuration.
    pub fn new(config: MachineConfig) -> Result<Self> {
        let mem = MemoryController::new(
            config.memory.size,
            !config.memory.force_aligned_access,
        )?;
        let mut bus = DeviceBus::new(config.memory.size);

        for device_config in &config.devices {
            let device = device::create(device_config)?;
            let mmio = device_config
                .mmio_base
                .map(|base| (base, device_config.mmio_size.unwrap_or(device.mmio_region_size())));
            let ports = device_config
                .port_base
                .map(|base| (base, device_config.port_count.unwrap_or(1)));
            bus.register(device, mmio, ports)?;
        }

        let mut cores = Vec::with_capacity(config.total_cores());
        for id in 0..config.total_cores() {
            let mut core = Core::new(id, config.cpu.math_coprocessor, config.cpu.check_frames);
            core.pic.install(config.cpu.ivt_address, IVT_ENTRIES);
            core.mmu.set_pt_base(config.cpu.pt_address);
            cores.push(core);
        }

        Ok(Self {
            config,
            cores,
            mem,
            bus,
            binaries: Vec::new(),
            ticks: 0,
            booted: false,
            snapshot_flag: Arc::new(AtomicBool::new(false)),
            snapshot_path: None,
            extra_binaries: Vec::new(),
            guest_stdout: false,
            interactive: false,
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Shared flag a host signal handler can set to request a snapshot
    /// at the next instruction boundary.
    pub fn snapshot_flag(&self) -> Arc<AtomicBool> {
        self.snapshot_flag.clone()
    }

    /// Where snapshots are written (`--machine-out`, guest requests).
    pub fn set_snapshot_path(&mut self, path: PathBuf) {
        self.snapshot_path = Some(path);
    }

    /// Additional binaries to load at boot (`--machine-in`).
    pub fn add_binary_path(&mut self, path: PathBuf) {
        self.extra_binaries.push(path);
    }

    /// Route guest TTY output to process stdout (`-g`).
    pub fn set_guest_stdout(&mut self, enabled: bool) {
        self.guest_stdout = enabled;
    }

    /// Start host-side device plumbing (stdin pump) when running.
    pub fn set_interactive(&mut self, enabled: bool) {
        self.interactive = enabled;
    }

    /// Turn on per-opcode execution counting.
    pub fn enable_profiling(&mut self) {
        for core in &mut self.cores {
            core.profile = Some(Default::default());
        }
    }

    /// Log the profiling histogram, most-executed first.
    pub fn log_profile(&self) {
        for core in &self.cores {
            let Some(profile) = &core.profile else { continue };
            let mut rows: Vec<_> = profile.iter().collect();
            rows.sort_by(|a, b| b.1.cmp(a.1));
            info!("core #{} profile ({} ticks):", core.id, self.ticks);
            for (mnemonic, count) in rows {
                info!("  {:8} {}", mnemonic, count);
            }
        }
    }

    /// Place an already-parsed object (tests, embedding). Must be called
    /// before [`Machine::boot`].
    pub fn add_object(&mut self, object: &Object, entry_symbol: &str) -> Result<()> {
        let loaded = loader::load_object(&mut self.mem, object, entry_symbol)?;
        self.binaries.push(loaded);
        Ok(())
    }

    /// Boot sequence: load binaries, build the HDT, initialize cores.
    pub fn boot(&mut self) -> Result<()> {
        // The IVT lives in guest memory; make sure vector reads cannot
        // fault before the guest installs handlers.
        self.mem.alloc_area(
            self.config.cpu.ivt_address,
            IVT_ENTRIES * IVT_ENTRY_SIZE,
        )?;

        if let Some(bootloader) = self.config.bootloader.clone() {
            let loaded = loader::load_file(&mut self.mem, &bootloader, "main")?;
            self.binaries.insert(0, loaded);
        }
        for binary in self.config.binaries.clone() {
            let loaded = loader::load_file(&mut self.mem, &binary.file, &binary.entry)?;
            self.binaries.push(loaded);
        }
        for path in self.extra_binaries.clone() {
            let loaded = loader::load_file(&mut self.mem, &path, "main")?;
            self.binaries.push(loaded);
        }

        let entry = self.binaries.first().map(|b| b.entry).unwrap_or(0);

        let hdt_base = self.build_hdt()?;
        self.wire_terminals()?;

        for id in 0..self.cores.len() {
            let sp = self.mem.alloc_stack(Some(id))?;
            let core = &mut self.cores[id];
            core.boot(entry, sp);
            // Boot protocol: guests discover the HDT through r0.
            core.regs.set(Reg(0), hdt_base);
        }

        self.booted = true;
        info!(
            "machine: booted, {} cores, {} bytes memory, {} devices, entry 0x{:08x}",
            self.cores.len(),
            self.mem.size(),
            self.bus.device_count(),
            entry
        );
        Ok(())
    }

    /// Build the HDT in guest memory; returns its base address.
    fn build_hdt(&mut self) -> Result<u32> {
        let mut builder = HdtBuilder::new()
            .cpu(self.config.total_cores() as u16, self.config.machine.cores as u16)
            .memory(self.config.memory.size);

        for index in 0..self.bus.device_count() {
            let (base, size) = self.bus.mmio_region_of(index).unwrap_or((0, 0));
            let device = self.bus.device(index).unwrap();
            builder = builder.device(
                device.name(),
                device.klass().code(),
                device.driver(),
                base,
                size,
                device.irq(),
            );
        }

        let blob = builder.build();
        let base = self.config.machine.hdt_address;
        self.mem.write_bytes(base, &blob)?;
        debug!("machine: HDT at 0x{:08x}, {} bytes", base, blob.len());
        Ok(base)
    }

    /// Resolve terminal wiring declared in the configuration: each
    /// terminal feeds one input device and drains one output device to
    /// host stdout.
    fn wire_terminals(&mut self) -> Result<()> {
        let stdout: SharedWriter = Arc::new(Mutex::new(Box::new(io::stdout())));

        for device_config in &self.config.devices {
            if device_config.driver != "terminal" {
                continue;
            }

            let terminal_index = self
                .bus
                .device_index_by_name(&device_config.name)
                .expect("terminal registered at construction");

            for (role, key) in [("input", "input"), ("output", "output")] {
                let target = device_config.get_str(key).ok_or_else(|| {
                    Error::Configuration(format!(
                        "terminal {}: missing '{}'",
                        device_config.name, key
                    ))
                })?;
                let target_index = self.bus.device_index_by_name(target).ok_or_else(|| {
                    Error::Configuration(format!(
                        "terminal {}: {} device '{}' does not exist",
                        device_config.name, role, target
                    ))
                })?;

                match role {
                    "input" => {
                        self.bus
                            .device_mut(terminal_index)
                            .unwrap()
                            .wire_input_sink(target_index);
                    }
                    _ => {
                        self.bus
                            .device_mut(target_index)
                            .unwrap()
                            .attach_output(stdout.clone());
                    }
                }
            }
        }

        if self.guest_stdout {
            // -g: all output-class devices write straight to stdout.
            for index in 0..self.bus.device_count() {
                if self.bus.device(index).unwrap().klass() == DeviceClass::Output {
                    self.bus
                        .device_mut(index)
                        .unwrap()
                        .attach_output(Arc::new(Mutex::new(Box::new(io::stdout()))));
                }
            }
        }

        Ok(())
    }

    /// Push one host input byte into a named input device, as if it
    /// arrived from a terminal backend.
    pub fn inject_input(&mut self, name: &str, byte: u8) -> Result<()> {
        let index = self
            .bus
            .device_index_by_name(name)
            .ok_or_else(|| Error::Configuration(format!("no such device: {}", name)))?;

        let mut raised = Vec::new();
        let mut snapshot_requested = false;
        let mut input = vec![(index, byte)];
        let mut ctx = DeviceContext {
            mem: &mut self.mem,
            raised: &mut raised,
            now: self.ticks,
            snapshot_requested: &mut snapshot_requested,
            input: &mut input,
        };
        self.bus.route_input(&mut ctx);

        for irq in raised {
            self.cores[0].raise_irq(irq);
        }
        Ok(())
    }

    /// One scheduler round: every live core advances one instruction,
    /// then devices run their timed callbacks, then raised IRQs and IPIs
    /// are routed.
    pub fn tick(&mut self) -> Result<Option<MachineExit>> {
        debug_assert!(self.booted, "tick before boot");

        if self.snapshot_flag.swap(false, Ordering::SeqCst) {
            self.snapshot_to_disk()?;
        }

        let mut raised = Vec::new();
        let mut input = Vec::new();
        let mut ipis = Vec::new();
        let mut snapshot_requested = false;
        let mut machine_halt = None;

        for index in 0..self.cores.len() {
            let mut ctx = ExecCtx {
                mem: &mut self.mem,
                bus: &mut self.bus,
                raised: &mut raised,
                now: self.ticks,
                snapshot_requested: &mut snapshot_requested,
                input: &mut input,
                ipis: &mut ipis,
            };

            match self.cores[index].tick(&mut ctx) {
                StepResult::Ok | StepResult::Idle | StepResult::Dead => {}
                StepResult::CoreHalted => {
                    debug!("machine: core #{} halted", index);
                }
                StepResult::MachineHalted(code) => {
                    machine_halt = Some(code);
                    break;
                }
                StepResult::Fatal(fault) => {
                    return Err(Error::FatalFault {
                        core: index,
                        fault: fault.to_string(),
                    });
                }
            }
        }

        // Devices observe virtual time once per round.
        {
            let mut dctx = DeviceContext {
                mem: &mut self.mem,
                raised: &mut raised,
                now: self.ticks,
                snapshot_requested: &mut snapshot_requested,
                input: &mut input,
            };
            self.bus.tick(&mut dctx);
        }

        // Device IRQs route to core 0; other cores are reached via IPI.
        for irq in raised {
            self.cores[0].raise_irq(irq);
        }
        for (target, irq) in ipis {
            match self.cores.get_mut(target) {
                Some(core) => core.raise_irq(irq),
                None => warn!("machine: IPI to nonexistent core {}", target),
            }
        }

        self.ticks += 1;

        if snapshot_requested {
            self.snapshot_to_disk()?;
        }

        if let Some(code) = machine_halt {
            for core in &mut self.cores {
                core.alive = false;
            }
            return Ok(Some(MachineExit::Halted(code)));
        }

        if self.cores.iter().all(|core| !core.alive) {
            return Ok(Some(MachineExit::Halted(self.exit_code())));
        }

        Ok(None)
    }

    /// Aggregate exit code: the first non-zero core exit code, else 0.
    pub fn exit_code(&self) -> u32 {
        self.cores
            .iter()
            .map(|core| core.exit_code)
            .find(|&code| code != 0)
            .unwrap_or(0)
    }

    /// Run until every core halts, a fatal fault occurs, or a budget is
    /// exceeded.
    pub fn run(&mut self) -> Result<MachineExit> {
        if !self.booted {
            self.boot()?;
        }
        if self.interactive {
            self.bus.start();
        }

        let started = Instant::now();
        let instruction_budget = self.config.machine.instruction_budget;
        let wall_budget = self.config.machine.wall_clock_budget_ms;

        loop {
            if let Some(exit) = self.tick()? {
                return Ok(exit);
            }

            if instruction_budget != 0 && self.ticks >= instruction_budget {
                warn!("machine: instruction budget exceeded");
                return Ok(MachineExit::Timeout);
            }
            if wall_budget != 0
                && self.ticks % 4096 == 0
                && started.elapsed() > Duration::from_millis(wall_budget)
            {
                warn!("machine: wall-clock budget exceeded");
                return Ok(MachineExit::Timeout);
            }
        }
    }

    /// Capture the full observable machine state.
    pub fn capture(&self) -> MachineState {
        MachineState {
            ticks: self.ticks,
            cores: self.cores.iter().map(Core::save_state).collect(),
            memory: MemoryState {
                size: self.mem.size(),
                pages: self.mem.pages().cloned().collect(),
            },
            devices: self
                .bus
                .devices()
                .map(|d| DeviceState {
                    name: d.name().to_string(),
                    driver: d.driver().to_string(),
                    state: d.save_state(),
                })
                .collect(),
        }
    }

    /// Restore a captured state into this machine. The machine must be
    /// built from the same configuration.
    pub fn restore(&mut self, state: &MachineState) -> Result<()> {
        if state.memory.size != self.mem.size() {
            return Err(Error::SnapshotFormat(format!(
                "memory size mismatch: snapshot {} vs machine {}",
                state.memory.size,
                self.mem.size()
            )));
        }
        if state.cores.len() != self.cores.len() {
            return Err(Error::SnapshotFormat(format!(
                "core count mismatch: snapshot {} vs machine {}",
                state.cores.len(),
                self.cores.len()
            )));
        }

        self.mem.restore_pages(state.memory.pages.clone());
        for (core, core_state) in self.cores.iter_mut().zip(&state.cores) {
            core.load_state(core_state);
        }
        for device_state in &state.devices {
            match self.bus.device_index_by_name(&device_state.name) {
                Some(index) => {
                    self.bus
                        .device_mut(index)
                        .unwrap()
                        .load_state(&device_state.state)?;
                }
                None => warn!(
                    "machine: snapshot device '{}' not present, skipping",
                    device_state.name
                ),
            }
        }
        self.ticks = state.ticks;
        self.booted = true;

        info!("machine: restored snapshot at tick {}", self.ticks);
        Ok(())
    }

    fn snapshot_to_disk(&mut self) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            warn!("machine: snapshot requested but no output path configured");
            return Ok(());
        };
        self.capture().save(&path)?;
        info!("machine: snapshot saved to {}", path.display());
        Ok(())
    }
}
