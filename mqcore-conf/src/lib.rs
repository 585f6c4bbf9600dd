#![deny(unsafe_code)]

//! Engine settings.
//!
//! Loaded from `/etc/mqcore/mqcore.toml`, `./mqcore.toml`, an optional file named in
//! [`Options`] and finally `MQCORE_*` environment variables (`MQCORE_TOPIC__WILDCARD=#`).
//! Every field has a default, so an empty configuration is valid.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use config::{Config, File};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use mqcore_utils::deserialize_duration;

pub use self::options::Options;

pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub topic: Topic,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    #[inline]
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqcore/mqcore").required(false))
            .add_source(File::with_name("mqcore").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("mqcore")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.log.check()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("log is {:?}, level: {:?}", self.log.to, self.log.level);
        log::info!("topic config is {:?}", self.topic);
        log::info!("mqtt config is {:?}", self.mqtt);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    //Value: off | file | console | both
    #[serde(default = "Log::to_default")]
    pub to: To,

    //Value: trace | debug | info | warn | error | critical
    #[serde(default = "Log::level_default", deserialize_with = "deserialize_level")]
    pub level: slog::Level,

    //Directory of the log file, may be empty when `file` is a full path.
    #[serde(default = "Log::dir_default")]
    pub dir: String,

    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self { to: Self::to_default(), level: Self::level_default(), dir: Self::dir_default(), file: Self::file_default() }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> slog::Level {
        slog::Level::Info
    }
    fn dir_default() -> String {
        "/var/log/mqcore".into()
    }
    fn file_default() -> String {
        "mqcore.log".into()
    }

    #[inline]
    pub fn filename(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.file)
    }

    /// File output needs a file name.
    pub fn check(&self) -> Result<()> {
        if self.to.file() && self.file.trim().is_empty() {
            bail!("log.file is empty but log.to is {:?}", self.to);
        }
        Ok(())
    }
}

/// Log output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> std::result::Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    slog::Level::from_str(&level).map_err(|_| de::Error::custom(format!("invalid log level `{level}`")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topic {
    //Byte that separates topic levels.
    #[serde(default = "Topic::separator_default")]
    pub separator: String,

    //Byte that marks a wildcard level in a subscription filter.
    #[serde(default = "Topic::wildcard_default")]
    pub wildcard: String,

    //Maximum number of topic levels, 0 means unlimited.
    #[serde(default)]
    pub max_levels: usize,
}

impl Default for Topic {
    #[inline]
    fn default() -> Self {
        Self { separator: Self::separator_default(), wildcard: Self::wildcard_default(), max_levels: 0 }
    }
}

impl Topic {
    fn separator_default() -> String {
        "/".into()
    }
    fn wildcard_default() -> String {
        "*".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    //Queue capacity of each acknowledgment gate direction, 0 means unlimited.
    #[serde(default)]
    pub max_queued_messages: usize,

    //Outbound packets not acknowledged within this interval are due for a retry, 0s disables it.
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,

    #[serde(default = "Mqtt::retain_enable_default")]
    pub retain_enable: bool,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            max_queued_messages: 0,
            retry_interval: Self::retry_interval_default(),
            retain_enable: Self::retain_enable_default(),
        }
    }
}

impl Mqtt {
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn retain_enable_default() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    use super::{Inner, Log, Options, Settings, To};

    fn write_conf(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("mqcore-conf-{}-{}.toml", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.topic.separator, "/");
        assert_eq!(s.topic.wildcard, "*");
        assert_eq!(s.topic.max_levels, 0);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(20));
        assert!(s.mqtt.retain_enable);
        assert_eq!(s.log.to, To::Console);
        assert_eq!(s.log.level, slog::Level::Info);
        assert_eq!(s.log.filename(), Path::new("/var/log/mqcore/mqcore.log"));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("mqcore-conf-test-{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r##"
[log]
to = "off"
level = "debug"

[topic]
wildcard = "#"
max_levels = 8

[mqtt]
max_queued_messages = 16
retry_interval = "1m30s"
retain_enable = false
"##
        )
        .unwrap();
        drop(f);

        let s = Settings::new(Options::with_cfg_name(path.to_string_lossy())).unwrap();
        assert_eq!(s.log.to, To::Off);
        assert_eq!(s.log.level, slog::Level::Debug);
        assert_eq!(s.topic.separator, "/");
        assert_eq!(s.topic.wildcard, "#");
        assert_eq!(s.topic.max_levels, 8);
        assert_eq!(s.mqtt.max_queued_messages, 16);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(90));
        assert!(!s.mqtt.retain_enable);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn log_file_name() {
        let mut log = Log { dir: String::new(), ..Log::default() };
        assert_eq!(log.filename(), Path::new("mqcore.log"));
        log.dir = "/tmp/mqcore/".into();
        assert_eq!(log.filename(), Path::new("/tmp/mqcore/mqcore.log"));
        log.file = "/abs/engine.log".into();
        assert_eq!(log.filename(), Path::new("/abs/engine.log"));
    }

    #[test]
    fn file_output_needs_a_file() {
        let mut inner = Inner::default();
        inner.log.file = " ".into();
        assert!(inner.log.check().is_ok());
        inner.log.to = To::Both;
        assert!(inner.log.check().is_err());
        inner.log.to = To::Off;
        assert!(inner.log.check().is_ok());

        let path = write_conf("nofile", "[log]\nto = \"file\"\nfile = \"\"\n");
        assert!(Settings::new(Options::with_cfg_name(path.to_string_lossy())).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_log_values_are_rejected() {
        let path = write_conf("badto", "[log]\nto = \"syslog\"\n");
        assert!(Settings::new(Options::with_cfg_name(path.to_string_lossy())).is_err());
        let _ = std::fs::remove_file(&path);

        let path = write_conf("badlevel", "[log]\nlevel = \"loud\"\n");
        assert!(Settings::new(Options::with_cfg_name(path.to_string_lossy())).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
