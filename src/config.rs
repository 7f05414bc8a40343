//! Process-wide configuration.
//!
//! Read once, on first use of any handle or spawn; after that it is fixed.

use std::sync::OnceLock;

use crate::error::ConfigError;
use crate::table::MIN_LENGTH;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Tunables for per-thread tables and the reclamation worker.
///
/// ```
/// let config = tlmap::Config::default()
///     .initial_table_length(64)
///     .reclaimer_thread_name("my-reclaimer");
/// assert_eq!(config.table_length(), 64);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    initial_table_length: usize,
    background_reclamation: bool,
    reclaimer_thread_name: String,
    roster_buffer_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_table_length: 32,
            background_reclamation: true,
            reclaimer_thread_name: "tlmap-reclaimer".to_string(),
            roster_buffer_len: 16,
        }
    }
}

impl Config {
    /// Array length (two cells per entry) of every newly created map.
    pub fn initial_table_length(mut self, length: usize) -> Self {
        self.initial_table_length = length;
        self
    }

    /// When false no worker thread is started; entries of dropped handles
    /// are then only cleaned up when their table is rehashed.
    pub fn background_reclamation(mut self, enabled: bool) -> Self {
        self.background_reclamation = enabled;
        self
    }

    /// Name given to the worker thread.
    pub fn reclaimer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.reclaimer_thread_name = name.into();
        self
    }

    /// Initial size of the worker's thread enumeration buffer. It grows on
    /// demand.
    pub fn roster_buffer_len(mut self, len: usize) -> Self {
        self.roster_buffer_len = len;
        self
    }

    /// Array length of newly created maps.
    pub fn table_length(&self) -> usize {
        self.initial_table_length
    }

    /// Whether the reclamation worker may be started.
    pub fn is_background_reclamation(&self) -> bool {
        self.background_reclamation
    }

    /// The worker thread's name.
    pub fn thread_name(&self) -> &str {
        &self.reclaimer_thread_name
    }

    /// Starting length of the worker's enumeration buffer.
    pub fn roster_len(&self) -> usize {
        self.roster_buffer_len
    }

    /// Check that the table length is a power of two of at least 16 and the
    /// enumeration buffer is not empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let length = self.initial_table_length;
        if length < MIN_LENGTH || !length.is_power_of_two() {
            return Err(ConfigError::InvalidTableLength {
                got: length,
                min: MIN_LENGTH,
            });
        }
        if self.roster_buffer_len == 0 {
            return Err(ConfigError::EmptyRosterBuffer);
        }
        Ok(())
    }
}

/// Install `config` for the rest of the process.
///
/// Must run before any [`ThreadLocal`](crate::ThreadLocal) is declared or
/// any thread is spawned through [`thread`](crate::thread).
pub fn configure(config: Config) -> Result<(), ConfigError> {
    config.validate()?;
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyConfigured)
}

pub(crate) fn get() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}
