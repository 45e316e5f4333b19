//! Machine configuration.
//!
//! A machine is declared by a TOML document with tables `[machine]`,
//! `[memory]`, `[cpu]`, `[bootloader]`, `[binary-N]` and `[device-N]`;
//! keys are kebab-case. `--set section:key=value` overrides are applied
//! to the parsed document before it is typed, so they reach every
//! consumer uniformly.
//!
//! ```toml
//! [machine]
//! cpus = 1
//! cores = 1
//!
//! [memory]
//! size = 65536
//!
//! [device-0]
//! name = "kbd0"
//! klass = "input"
//! driver = "keyboard"
//! mmio-base = 0x80000100
//! irq = 8
//! ```

use std::path::{Path, PathBuf};

use log::debug;
use toml::value::{Table, Value};

use crate::error::{Error, Result};

/// `[machine]` table.
#[derive(Debug, Clone)]
pub struct MachineSection {
    pub cpus: u32,
    pub cores: u32,
    pub hdt_address: u32,
    /// Total instruction budget; 0 means unlimited.
    pub instruction_budget: u64,
    /// Wall-clock budget in milliseconds; 0 means unlimited.
    pub wall_clock_budget_ms: u64,
}

/// `[memory]` table.
#[derive(Debug, Clone)]
pub struct MemorySection {
    pub size: u32,
    /// When set, unaligned accesses trap instead of being decomposed.
    pub force_aligned_access: bool,
}

/// `[cpu]` table.
#[derive(Debug, Clone)]
pub struct CpuSection {
    pub ivt_address: u32,
    pub pt_address: u32,
    pub math_coprocessor: bool,
    /// Validate CALL/RET frame discipline at runtime.
    pub check_frames: bool,
}

/// One `[binary-N]` table.
#[derive(Debug, Clone)]
pub struct BinaryConfig {
    pub file: PathBuf,
    /// Entry symbol; falls back to the first TEXT section base.
    pub entry: String,
}

/// One `[device-N]` table.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub klass: String,
    pub driver: String,
    pub mmio_base: Option<u32>,
    pub mmio_size: Option<u32>,
    pub irq: Option<u32>,
    pub port_base: Option<u16>,
    pub port_count: Option<u16>,
    /// Driver-specific keys.
    pub options: Table,
}

impl DeviceConfig {
    /// Minimal config for unit tests.
    pub fn for_tests(name: &str, klass: &str, driver: &str) -> Self {
        Self {
            name: name.to_string(),
            klass: klass.to_string(),
            driver: driver.to_string(),
            mmio_base: None,
            mmio_size: None,
            irq: None,
            port_base: None,
            port_count: None,
            options: Table::new(),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(Value::as_integer)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| {
            Error::Configuration(format!("device {}: missing key '{}'", self.name, key))
        })
    }
}

/// Fully typed machine configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub machine: MachineSection,
    pub memory: MemorySection,
    pub cpu: CpuSection,
    pub bootloader: Option<PathBuf>,
    pub binaries: Vec<BinaryConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl MachineConfig {
    /// Load a configuration file and apply `--set` overrides.
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::ConfigNotFound(path.to_path_buf()))?;
        Self::from_str(&text, overrides)
    }

    /// Parse a configuration document.
    pub fn from_str(text: &str, overrides: &[String]) -> Result<Self> {
        let mut doc: Value = text
            .parse()
            .map_err(|e| Error::Configuration(format!("TOML parse error: {}", e)))?;

        for item in overrides {
            apply_override(&mut doc, item)?;
        }

        let root = doc
            .as_table()
            .ok_or_else(|| Error::Configuration("top level must be a table".into()))?;

        let machine = root.get("machine").and_then(Value::as_table);
        let memory = root.get("memory").and_then(Value::as_table);
        let cpu = root.get("cpu").and_then(Value::as_table);

        let config = Self {
            machine: MachineSection {
                cpus: get_u32(machine, "cpus", 1)?,
                cores: get_u32(machine, "cores", 1)?,
                hdt_address: get_u32(machine, "hdt-address", crate::memory::layout::DEFAULT_HDT_BASE)?,
                instruction_budget: get_u64(machine, "instruction-budget", 0)?,
                wall_clock_budget_ms: get_u64(machine, "wall-clock-budget-ms", 0)?,
            },
            memory: MemorySection {
                size: get_u32(memory, "size", 0x10_0000)?,
                force_aligned_access: get_bool(memory, "force-aligned-access", true),
            },
            cpu: CpuSection {
                ivt_address: get_u32(cpu, "ivt-address", crate::memory::layout::DEFAULT_IVT_BASE)?,
                pt_address: get_u32(cpu, "pt-address", crate::memory::layout::DEFAULT_PT_BASE)?,
                math_coprocessor: get_bool(cpu, "math-coprocessor", true),
                check_frames: get_bool(cpu, "check-frames", false),
            },
            bootloader: root
                .get("bootloader")
                .and_then(Value::as_table)
                .and_then(|t| t.get("file"))
                .and_then(Value::as_str)
                .map(PathBuf::from),
            binaries: parse_numbered(root, "binary-", parse_binary)?,
            devices: parse_numbered(root, "device-", parse_device)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.machine.cpus == 0 || self.machine.cores == 0 {
            return Err(Error::InvalidCoreCount(self.machine.cpus * self.machine.cores));
        }
        if self.memory.size == 0 || self.memory.size % crate::memory::PAGE_SIZE != 0 {
            return Err(Error::InvalidMemorySize(self.memory.size));
        }
        if self.bootloader.is_none() && self.binaries.is_empty() {
            debug!("config: no bootloader and no binaries; machine will halt immediately");
        }
        for device in &self.devices {
            if device.klass.is_empty() || device.driver.is_empty() {
                return Err(Error::Configuration(format!(
                    "device {}: 'klass' and 'driver' are required",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Total number of cores across all CPUs.
    pub fn total_cores(&self) -> usize {
        (self.machine.cpus * self.machine.cores) as usize
    }
}

fn parse_binary(name: &str, table: &Table) -> Result<BinaryConfig> {
    let file = table
        .get("file")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Configuration(format!("{}: missing 'file'", name)))?;
    Ok(BinaryConfig {
        file: PathBuf::from(file),
        entry: table
            .get("entry")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string(),
    })
}

fn parse_device(name: &str, table: &Table) -> Result<DeviceConfig> {
    let required = |key: &str| -> Result<String> {
        table
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Configuration(format!("{}: missing '{}'", name, key)))
    };

    Ok(DeviceConfig {
        name: table
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string(),
        klass: required("klass")?,
        driver: required("driver")?,
        mmio_base: opt_u32(table, "mmio-base")?,
        mmio_size: opt_u32(table, "mmio-size")?,
        irq: opt_u32(table, "irq")?,
        port_base: opt_u32(table, "port-base")?.map(|p| p as u16),
        port_count: opt_u32(table, "port-count")?.map(|p| p as u16),
        options: table.clone(),
    })
}

/// Collect `prefix-0`, `prefix-1`, ... tables in index order.
fn parse_numbered<T>(
    root: &Table,
    prefix: &str,
    parse: fn(&str, &Table) -> Result<T>,
) -> Result<Vec<T>> {
    let mut numbered: Vec<(u32, &str, &Table)> = Vec::new();

    for (key, value) in root {
        if let Some(suffix) = key.strip_prefix(prefix) {
            let index: u32 = suffix.parse().map_err(|_| {
                Error::Configuration(format!("bad section name: [{}]", key))
            })?;
            let table = value
                .as_table()
                .ok_or_else(|| Error::Configuration(format!("[{}] must be a table", key)))?;
            numbered.push((index, key, table));
        }
    }

    numbered.sort_by_key(|&(index, _, _)| index);
    numbered
        .into_iter()
        .map(|(_, key, table)| parse(key, table))
        .collect()
}

fn get_u32(table: Option<&Table>, key: &str, default: u32) -> Result<u32> {
    match table.and_then(|t| t.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| Error::Configuration(format!("'{}' must be a u32", key))),
    }
}

fn get_u64(table: Option<&Table>, key: &str, default: u64) -> Result<u64> {
    match table.and_then(|t| t.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| Error::Configuration(format!("'{}' must be a u64", key))),
    }
}

fn get_bool(table: Option<&Table>, key: &str, default: bool) -> bool {
    table
        .and_then(|t| t.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

fn opt_u32(table: &Table, key: &str) -> Result<Option<u32>> {
    match table.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| Error::Configuration(format!("'{}' must be a u32", key))),
    }
}

/// Apply one `section:key=value` override to the parsed document.
fn apply_override(doc: &mut Value, item: &str) -> Result<()> {
    let (section, rest) = item
        .split_once(':')
        .ok_or_else(|| Error::Configuration(format!("bad --set (want section:key=value): {}", item)))?;
    let (key, raw) = rest
        .split_once('=')
        .ok_or_else(|| Error::Configuration(format!("bad --set (want section:key=value): {}", item)))?;

    let value = parse_scalar(raw);

    let root = doc
        .as_table_mut()
        .ok_or_else(|| Error::Configuration("top level must be a table".into()))?;
    let table = root
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Table::new()))
        .as_table_mut()
        .ok_or_else(|| Error::Configuration(format!("[{}] is not a table", section)))?;

    debug!("config.override: [{}] {} = {}", section, key, raw);
    table.insert(key.to_string(), value);
    Ok(())
}

/// Interpret an override value: integer (decimal or 0x hex), boolean, or
/// string.
fn parse_scalar(raw: &str) -> Value {
    if let Some(hex) = raw.strip_prefix("0x") {
        if let Ok(i) = i64::from_str_radix(hex, 16) {
            return Value::Integer(i);
        }
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    match raw {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(raw.to_string()),
    }
}
