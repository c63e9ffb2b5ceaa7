//! Data file pool settings
//!
//! The store root carries a `settings.xml` describing how wide each shard
//! file is (`time` in `unit`) and how many slices the pool retains. The file
//! uses the Java-Properties XML shape so that stores written by the legacy
//! tooling remain readable. The format is versioned; foreign versions are
//! refused.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, StratumError};

/// Name of the settings file within the store root
pub const SETTINGS_FILE_NAME: &str = "settings.xml";

/// Settings format version this crate reads and writes
pub const SETTINGS_VERSION: u32 = 1;

/// Unit of the configured slice width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Identifier used in the settings file
    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "NANOSECONDS",
            TimeUnit::Microseconds => "MICROSECONDS",
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Days => "DAYS",
        }
    }

    /// Parse the settings file identifier
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "NANOSECONDS" => Ok(TimeUnit::Nanoseconds),
            "MICROSECONDS" => Ok(TimeUnit::Microseconds),
            "MILLISECONDS" => Ok(TimeUnit::Milliseconds),
            "SECONDS" => Ok(TimeUnit::Seconds),
            "MINUTES" => Ok(TimeUnit::Minutes),
            "HOURS" => Ok(TimeUnit::Hours),
            "DAYS" => Ok(TimeUnit::Days),
            other => Err(StratumError::InvalidArgument(format!(
                "unknown time unit '{other}'"
            ))),
        }
    }

    /// Convert an amount of this unit to milliseconds; sub-millisecond units
    /// truncate
    pub fn to_millis(self, amount: i64) -> i64 {
        match self {
            TimeUnit::Nanoseconds => amount / 1_000_000,
            TimeUnit::Microseconds => amount / 1_000,
            TimeUnit::Milliseconds => amount,
            TimeUnit::Seconds => amount * 1_000,
            TimeUnit::Minutes => amount * 60_000,
            TimeUnit::Hours => amount * 3_600_000,
            TimeUnit::Days => amount * 86_400_000,
        }
    }
}

/// Slice width and retention of a data file pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Width of one slice, expressed in `unit`
    pub time: i64,
    /// Unit of `time`
    pub unit: TimeUnit,
    /// Number of slices the pool retains
    pub count: u32,
}

impl PoolSettings {
    /// Width of one slice in milliseconds; never below 1
    pub fn slice_millis(&self) -> i64 {
        self.unit.to_millis(self.time).max(1)
    }

    /// Retention target in milliseconds covered by the configured slice count
    pub fn retention_millis(&self) -> i64 {
        self.slice_millis() * i64::from(self.count)
    }

    /// Load the settings from `{base}/settings.xml`
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(SETTINGS_FILE_NAME);
        let content = fs::read_to_string(&path)?;
        debug!("loaded pool settings from '{}'", path.display());
        Self::parse(&content)
    }

    /// Write the settings to `{base}/settings.xml`
    pub fn store(&self, base: &Path) -> Result<()> {
        fs::create_dir_all(base)?;
        let path = base.join(SETTINGS_FILE_NAME);
        fs::write(&path, self.render())?;
        debug!("stored pool settings to '{}'", path.display());
        Ok(())
    }

    fn render(&self) -> String {
        format!(
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>\n",
                "<!DOCTYPE properties SYSTEM \"http://java.sun.com/dtd/properties.dtd\">\n",
                "<properties>\n",
                "<comment>stratum data file pool</comment>\n",
                "<entry key=\"version\">{version}</entry>\n",
                "<entry key=\"time\">{time}</entry>\n",
                "<entry key=\"unit\">{unit}</entry>\n",
                "<entry key=\"count\">{count}</entry>\n",
                "</properties>\n"
            ),
            version = SETTINGS_VERSION,
            time = self.time,
            unit = self.unit.as_str(),
            count = self.count,
        )
    }

    /// Parse the Java-Properties XML shape, leniently: only the
    /// `<entry key="...">value</entry>` pairs are interpreted.
    pub fn parse(content: &str) -> Result<Self> {
        let version: u32 = required_entry(content, "version")?;
        if version != SETTINGS_VERSION {
            return Err(StratumError::InvalidArgument(format!(
                "unsupported settings version {version} (expected {SETTINGS_VERSION})"
            )));
        }
        Ok(Self {
            time: required_entry(content, "time")?,
            unit: TimeUnit::parse(entry_value(content, "unit").ok_or_else(|| {
                StratumError::InvalidArgument("settings entry 'unit' is missing".into())
            })?)?,
            count: required_entry(content, "count")?,
        })
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            time: 1,
            unit: TimeUnit::Days,
            count: 30,
        }
    }
}

fn entry_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("key=\"{key}\">");
    let start = content.find(&marker)? + marker.len();
    let end = content[start..].find('<')?;
    Some(content[start..start + end].trim())
}

fn required_entry<T: std::str::FromStr>(content: &str, key: &str) -> Result<T> {
    let raw = entry_value(content, key).ok_or_else(|| {
        StratumError::InvalidArgument(format!("settings entry '{key}' is missing"))
    })?;
    raw.parse().map_err(|_| {
        StratumError::InvalidArgument(format!("settings entry '{key}' has invalid value '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let settings = PoolSettings {
            time: 6,
            unit: TimeUnit::Hours,
            count: 28,
        };
        settings.store(dir.path()).unwrap();
        assert_eq!(PoolSettings::load(dir.path()).unwrap(), settings);
    }

    #[test]
    fn test_refuses_foreign_version() {
        let content = PoolSettings::default()
            .render()
            .replace("key=\"version\">1<", "key=\"version\">2<");
        assert!(matches!(
            PoolSettings::parse(&content),
            Err(StratumError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_entry_is_rejected() {
        assert!(PoolSettings::parse("<properties></properties>").is_err());
    }

    #[test]
    fn test_slice_width() {
        let settings = PoolSettings {
            time: 2,
            unit: TimeUnit::Minutes,
            count: 10,
        };
        assert_eq!(settings.slice_millis(), 120_000);
        assert_eq!(settings.retention_millis(), 1_200_000);
        assert_eq!(TimeUnit::Nanoseconds.to_millis(5_000_000), 5);
    }
}
