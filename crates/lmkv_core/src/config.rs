//! Environment configuration.

use crate::error::{CoreError, CoreResult};
use lmkv_engine::{
    EngineOptions, EnvFlag, EnvFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    DEFAULT_MODE,
};

/// Configuration for opening an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvConfig {
    /// Permission bits for created files.
    pub mode: u32,

    /// Maximum number of simultaneous read transactions.
    pub max_readers: u32,

    /// Maximum number of named databases. Zero is raised to one.
    pub max_dbs: u32,

    /// Maximum size of the data in bytes (0 = engine default).
    pub map_size: u64,

    /// Environment flags.
    pub flags: EnvFlags,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            map_size: DEFAULT_MAP_SIZE,
            flags: EnvFlags::new(),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> CoreResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(CoreError::invalid_option_value(name, value)),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> CoreResult<T> {
    value
        .trim()
        .replace('_', "")
        .parse()
        .map_err(|_| CoreError::invalid_option_value(name, value))
}

/// Parses permission bits, always as octal (`755`, `0755`, `0o755`).
fn parse_mode(name: &str, value: &str) -> CoreResult<u32> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| CoreError::invalid_option_value(name, value))
}

impl EnvConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the permission bits for created files.
    #[must_use]
    pub const fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the maximum number of readers.
    #[must_use]
    pub const fn max_readers(mut self, value: u32) -> Self {
        self.max_readers = value;
        self
    }

    /// Sets the maximum number of named databases.
    #[must_use]
    pub const fn max_dbs(mut self, value: u32) -> Self {
        self.max_dbs = value;
        self
    }

    /// Sets the map size in bytes.
    #[must_use]
    pub const fn map_size(mut self, size: u64) -> Self {
        self.map_size = size;
        self
    }

    /// Replaces all flags.
    #[must_use]
    pub const fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets or clears one flag.
    #[must_use]
    pub fn flag(mut self, flag: EnvFlag, on: bool) -> Self {
        self.flags.set(flag, on);
        self
    }

    /// Sets whether commits skip fsync.
    #[must_use]
    pub const fn no_sync(mut self, value: bool) -> Self {
        self.flags.no_sync = value;
        self
    }

    /// Sets whether metadata writes skip fsync.
    #[must_use]
    pub const fn no_meta_sync(mut self, value: bool) -> Self {
        self.flags.no_meta_sync = value;
        self
    }

    /// Sets whether the path names the data file instead of a directory.
    #[must_use]
    pub const fn no_sub_dir(mut self, value: bool) -> Self {
        self.flags.no_sub_dir = value;
        self
    }

    /// Sets whether the environment is read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.flags.read_only = value;
        self
    }

    /// Sets whether writes go through the map.
    #[must_use]
    pub const fn write_map(mut self, value: bool) -> Self {
        self.flags.write_map = value;
        self
    }

    /// Sets whether map flushes are asynchronous.
    #[must_use]
    pub const fn map_async(mut self, value: bool) -> Self {
        self.flags.map_async = value;
        self
    }

    /// Sets whether a fixed map address is requested.
    #[must_use]
    pub const fn fixed_map(mut self, value: bool) -> Self {
        self.flags.fixed_map = value;
        self
    }

    /// Applies one named option.
    ///
    /// Numeric options take decimal values, `mode` takes octal. Flags take
    /// `true`/`false`, `yes`/`no`, `on`/`off` or `1`/`0`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` for an unknown name and `InvalidOptionValue`
    /// for a value that cannot be parsed.
    pub fn set_option(&mut self, name: &str, value: &str) -> CoreResult<()> {
        let key = name.trim().to_ascii_lowercase().replace('-', "_");
        match key.as_str() {
            "mode" => self.mode = parse_mode(name, value)?,
            "maxreaders" | "max_readers" => self.max_readers = parse_number(name, value)?,
            "maxdbs" | "max_dbs" => self.max_dbs = parse_number(name, value)?,
            "mapsize" | "map_size" => self.map_size = parse_number(name, value)?,
            _ => {
                let flag: EnvFlag = name
                    .parse()
                    .map_err(|_| CoreError::invalid_option(name))?;
                self.flags.set(flag, parse_bool(name, value)?);
            }
        }
        Ok(())
    }

    /// Builds a configuration from `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`EnvConfig::set_option`].
    pub fn from_options<'a, I>(options: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.set_option(name, value)?;
        }
        Ok(config)
    }

    /// Returns the options handed to the engine.
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            flags: self.flags,
            mode: self.mode,
            max_readers: self.max_readers,
            max_dbs: self.max_dbs.max(1),
            map_size: self.map_size,
        }
    }
}
