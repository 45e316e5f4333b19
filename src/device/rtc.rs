//! Real-time clock.
//!
//! Exposes a calendar register file seeded from the host clock at
//! construction and advanced by virtual time, plus a programmable timer
//! IRQ. One emulated second is [`TICKS_PER_SECOND`] scheduler rounds, so
//! runs are reproducible regardless of host speed.
//!
//! ## Register map
//!
//! | Offset | Name      | Description |
//! |--------|-----------|-------------|
//! | 0x00   | SECONDS   | 0..59 |
//! | 0x04   | MINUTES   | 0..59 |
//! | 0x08   | HOURS     | 0..23 |
//! | 0x0C   | DAY       | 1..31 |
//! | 0x10   | MONTH     | 1..12 |
//! | 0x14   | YEAR      | full year |
//! | 0x18   | FREQUENCY | timer IRQs per emulated second; 0 disables (r/w) |

use log::debug;
use serde_json::json;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceClass, DeviceContext, Width};
use crate::error::{Fault, Result};

/// Virtual ticks per emulated second.
pub const TICKS_PER_SECOND: u64 = 1024;

/// Default IRQ line.
pub const DEFAULT_IRQ: u32 = crate::irq::IRQ_BASE + 1;

/// Calendar + timer device.
pub struct Rtc {
    name: String,
    irq: u32,
    seconds: u32,
    minutes: u32,
    hours: u32,
    day: u32,
    month: u32,
    year: u32,
    frequency: u32,
    last_second_tick: u64,
}

impl Rtc {
    pub const REG_SECONDS: u32 = 0x00;
    pub const REG_MINUTES: u32 = 0x04;
    pub const REG_HOURS: u32 = 0x08;
    pub const REG_DAY: u32 = 0x0C;
    pub const REG_MONTH: u32 = 0x10;
    pub const REG_YEAR: u32 = 0x14;
    pub const REG_FREQUENCY: u32 = 0x18;

    /// Create an RTC seeded from an explicit UTC epoch (tests, restore).
    pub fn with_epoch(name: impl Into<String>, irq: u32, epoch: i64) -> Self {
        let mut rtc = Self {
            name: name.into(),
            irq,
            seconds: 0,
            minutes: 0,
            hours: 0,
            day: 1,
            month: 1,
            year: 1970,
            frequency: 0,
            last_second_tick: 0,
        };
        rtc.set_from_epoch(epoch);
        rtc
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let now = unsafe { libc::time(std::ptr::null_mut()) };
        Ok(Self::with_epoch(
            config.name.clone(),
            config.irq.unwrap_or(DEFAULT_IRQ),
            now as i64,
        ))
    }

    fn set_from_epoch(&mut self, epoch: i64) {
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        let t = epoch as libc::time_t;
        unsafe { libc::gmtime_r(&t, &mut tm) };

        self.seconds = tm.tm_sec as u32;
        self.minutes = tm.tm_min as u32;
        self.hours = tm.tm_hour as u32;
        self.day = tm.tm_mday as u32;
        self.month = tm.tm_mon as u32 + 1;
        self.year = (tm.tm_year + 1900) as u32;
    }

    fn days_in_month(year: u32, month: u32) -> u32 {
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            _ => {
                let leap = year % 4 == 0 && (year % 100 != 0 || year % 400 == 0);
                if leap {
                    29
                } else {
                    28
                }
            }
        }
    }

    fn advance_second(&mut self) {
        self.seconds += 1;
        if self.seconds < 60 {
            return;
        }
        self.seconds = 0;
        self.minutes += 1;
        if self.minutes < 60 {
            return;
        }
        self.minutes = 0;
        self.hours += 1;
        if self.hours < 24 {
            return;
        }
        self.hours = 0;
        self.day += 1;
        if self.day <= Self::days_in_month(self.year, self.month) {
            return;
        }
        self.day = 1;
        self.month += 1;
        if self.month <= 12 {
            return;
        }
        self.month = 1;
        self.year += 1;
    }
}

impl Device for Rtc {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "rtc"
    }

    fn klass(&self) -> DeviceClass {
        DeviceClass::Rtc
    }

    fn irq(&self) -> Option<u32> {
        Some(self.irq)
    }

    fn reset(&mut self) {
        self.frequency = 0;
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        offset: u32,
        _width: Width,
    ) -> std::result::Result<u32, Fault> {
        let value = match offset {
            Self::REG_SECONDS => self.seconds,
            Self::REG_MINUTES => self.minutes,
            Self::REG_HOURS => self.hours,
            Self::REG_DAY => self.day,
            Self::REG_MONTH => self.month,
            Self::REG_YEAR => self.year,
            Self::REG_FREQUENCY => self.frequency,
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
        if offset == Self::REG_FREQUENCY {
            // Clamp to one IRQ per tick.
            self.frequency = value.min(TICKS_PER_SECOND as u32);
            debug!("rtc {}: frequency={}", self.name, self.frequency);
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) {
        if ctx.now >= self.last_second_tick + TICKS_PER_SECOND {
            self.last_second_tick = ctx.now;
            self.advance_second();
        }

        if self.frequency > 0 {
            let period = TICKS_PER_SECOND / self.frequency as u64;
            if period > 0 && ctx.now % period == 0 {
                ctx.raised.push(self.irq);
            }
        }
    }

    fn save_state(&self) -> serde_json::Value {
        json!({
            "seconds": self.seconds,
            "minutes": self.minutes,
            "hours": self.hours,
            "day": self.day,
            "month": self.month,
            "year": self.year,
            "frequency": self.frequency,
            "last_second_tick": self.last_second_tick,
        })
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        let get = |key: &str| state[key].as_u64().unwrap_or(0);
        self.seconds = get("seconds") as u32;
        self.minutes = get("minutes") as u32;
        self.hours = get("hours") as u32;
        self.day = get("day") as u32;
        self.month = get("month") as u32;
        self.year = get("year") as u32;
        self.frequency = get("frequency") as u32;
        self.last_second_tick = get("last_second_tick");
        Ok(())
    }
}
