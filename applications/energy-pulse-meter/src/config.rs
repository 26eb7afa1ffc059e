use crate::error::{AppError, Result};
use chrono::{Datelike, NaiveDate, NaiveTime};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub meter: MeterConfig,
    pub tariff: TariffConfig,
    pub influx: InfluxConfig,
    pub gpio: GpioConfig,
    /// Sleep between delivery attempts while no pulses are pending.
    pub idle_interval_secs: u64,
    /// Unsent batch content is appended here on shutdown.
    pub recovery_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Energy represented by one pulse, in watt-seconds.
    pub energy_per_pulse: u32,
    pub first_pulse_power: FirstPulsePower,
}

/// What to do with the power value of the first pulse after startup, which
/// is measured against the zero sentinel instead of a real previous pulse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FirstPulsePower {
    #[default]
    Suppress,
    Report,
}

impl FromStr for FirstPulsePower {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "suppress" => Ok(Self::Suppress),
            "report" => Ok(Self::Report),
            other => Err(format!(
                "unknown policy '{}'. Supported: suppress, report",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TariffConfig {
    /// Evening boundary; times strictly after it are low tariff.
    pub low_tariff_start: NaiveTime,
    /// Morning boundary; times strictly before it are low tariff.
    pub low_tariff_end: NaiveTime,
    /// Year-independent low tariff dates.
    pub low_tariff_days: Vec<FixedDay>,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            low_tariff_start: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or_default(),
            low_tariff_end: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
            low_tariff_days: default_low_tariff_days(),
        }
    }
}

fn default_low_tariff_days() -> Vec<FixedDay> {
    vec![
        // new year's day
        FixedDay { month: 1, day: 1 },
        // king's day
        FixedDay { month: 4, day: 27 },
        // christmas
        FixedDay { month: 12, day: 25 },
        FixedDay { month: 12, day: 26 },
    ]
}

/// A calendar day that repeats every year, written as `MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDay {
    pub month: u32,
    pub day: u32,
}

impl FixedDay {
    pub fn matches(&self, date: NaiveDate) -> bool {
        date.month() == self.month && date.day() == self.day
    }
}

impl FromStr for FixedDay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (month, day) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("'{}' is not in MM-DD format", s.trim()))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in '{}'", s.trim()))?;
        let day: u32 = day
            .parse()
            .map_err(|_| format!("invalid day in '{}'", s.trim()))?;

        // 2000 is a leap year, so 02-29 is accepted
        if NaiveDate::from_ymd_opt(2000, month, day).is_none() {
            return Err(format!("'{}' is not a calendar day", s.trim()));
        }
        Ok(Self { month, day })
    }
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Write endpoint, e.g. "http://influx:8086/write?db=energy"
    pub address: String,
    pub series: String,
    pub meter_high: String,
    pub meter_low: String,
    pub timeout_secs: u64,
}

impl InfluxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct GpioConfig {
    pub chip: String,
    pub pulse_pin: u32,
    pub button_pin: u32,
    /// Edge monitor executable, libgpiod's `gpiomon` by default.
    pub monitor_command: String,
    pub pulse_debounce_ms: u64,
    pub button_debounce_ms: u64,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tariff_defaults = TariffConfig::default();

        let low_tariff_days = match lookup("LOW_TARIFF_DAYS") {
            Some(raw) => parse_fixed_days(&raw)?,
            None => tariff_defaults.low_tariff_days,
        };
        let low_tariff_start = match lookup("LOW_TARIFF_START") {
            Some(raw) => parse_time("LOW_TARIFF_START", &raw)?,
            None => tariff_defaults.low_tariff_start,
        };
        let low_tariff_end = match lookup("LOW_TARIFF_END") {
            Some(raw) => parse_time("LOW_TARIFF_END", &raw)?,
            None => tariff_defaults.low_tariff_end,
        };

        let cfg = Config {
            meter: MeterConfig {
                energy_per_pulse: parse_required(&lookup, "ENERGY_PER_PULSE")?,
                first_pulse_power: parse_or(
                    &lookup,
                    "FIRST_PULSE_POWER",
                    FirstPulsePower::Suppress,
                )?,
            },
            tariff: TariffConfig {
                low_tariff_start,
                low_tariff_end,
                low_tariff_days,
            },
            influx: InfluxConfig {
                address: required(&lookup, "INFLUX_ADDRESS")?,
                series: required(&lookup, "INFLUX_SERIES")?,
                meter_high: required(&lookup, "INFLUX_METER_HIGH")?,
                meter_low: required(&lookup, "INFLUX_METER_LOW")?,
                timeout_secs: parse_or(&lookup, "DELIVERY_TIMEOUT_SECS", 10)?,
            },
            gpio: GpioConfig {
                chip: lookup("GPIO_CHIP").unwrap_or_else(|| "gpiochip0".to_string()),
                pulse_pin: parse_required(&lookup, "PULSE_METER_PIN")?,
                button_pin: parse_required(&lookup, "INTERRUPT_BUTTON_PIN")?,
                monitor_command: lookup("GPIO_MONITOR_COMMAND")
                    .unwrap_or_else(|| "gpiomon".to_string()),
                pulse_debounce_ms: parse_or(&lookup, "PULSE_DEBOUNCE_MS", 50)?,
                button_debounce_ms: parse_or(&lookup, "BUTTON_DEBOUNCE_MS", 100)?,
            },
            idle_interval_secs: parse_or(&lookup, "IDLE_INTERVAL_SECS", 10)?,
            recovery_file: lookup("RECOVERY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("message_body.txt")),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.meter.energy_per_pulse == 0 {
            return Err(AppError::Config(
                "ENERGY_PER_PULSE must be greater than 0".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.influx.address).map_err(|e| {
            AppError::Config(format!(
                "INFLUX_ADDRESS '{}' is not a valid URL: {}",
                self.influx.address, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AppError::Config(format!(
                "INFLUX_ADDRESS must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.influx.series.is_empty() || self.influx.series.contains([' ', ',']) {
            return Err(AppError::Config(
                "INFLUX_SERIES must be non-empty and contain no spaces or commas".to_string(),
            ));
        }
        for (key, tag) in [
            ("INFLUX_METER_HIGH", &self.influx.meter_high),
            ("INFLUX_METER_LOW", &self.influx.meter_low),
        ] {
            if tag.is_empty() || tag.contains([' ', ',', '=']) {
                return Err(AppError::Config(format!(
                    "{} must be non-empty and contain no spaces, commas or '='",
                    key
                )));
            }
        }

        if self.tariff.low_tariff_start == self.tariff.low_tariff_end {
            return Err(AppError::Config(
                "LOW_TARIFF_START and LOW_TARIFF_END must differ".to_string(),
            ));
        }
        if self.idle_interval_secs == 0 {
            return Err(AppError::Config(
                "IDLE_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.influx.timeout_secs == 0 {
            return Err(AppError::Config(
                "DELIVERY_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Config(format!("missing environment variable: {}", key)))
}

fn parse_required<F, T>(lookup: &F, key: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let raw = required(lookup, key)?;
    raw.parse()
        .map_err(|e| AppError::Config(format!("invalid value '{}' for {}: {}", raw, key, e)))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("invalid value '{}' for {}: {}", raw, key, e))),
        None => Ok(default),
    }
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| AppError::Config(format!("{} must be HH:MM or HH:MM:SS, got '{}'", key, raw)))
}

fn parse_fixed_days(raw: &str) -> Result<Vec<FixedDay>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| AppError::Config(format!("LOW_TARIFF_DAYS: {}", e)))
        })
        .collect()
}
