use crate::error::{Result, SmuxError};
use std::time::Duration;

/// Largest payload a frame header can describe.
pub const MAX_FRAME_SIZE_LIMIT: usize = u16::MAX as usize;

/// Configuration for a smux session.
///
/// `Config` contains all the tunable parameters for a smux session: protocol
/// version, keep-alive cadence, frame size and the receive-side buffer caps.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use smux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.version, 1);
/// assert!(config.enable_keep_alive);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use smux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .version(2)
///     .keep_alive_interval(Duration::from_secs(30))
///     .keep_alive_interval_max(Duration::from_secs(45))
///     .max_frame_size(32 * 1024)
///     .build()
///     .expect("Valid configuration");
/// assert_eq!(config.version, 2);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Wire protocol version, 1 or 2. Version 2 adds per-stream windows.
    pub version: u8,
    /// Lower bound of the NOP cadence.
    pub keep_alive_interval: Duration,
    /// Upper bound of the NOP cadence; each tick is sampled uniformly
    /// between `keep_alive_interval` and this value.
    pub keep_alive_interval_max: Duration,
    /// Round-trip allowance granted to the peer on top of its NOP cadence
    /// before it is declared dead.
    ///
    /// The effective liveness threshold is `keep_alive_interval_max +
    /// keep_alive_timeout` of silence. Silence is checked every
    /// `keep_alive_interval`, so a dead peer is noticed at most one
    /// `keep_alive_interval` after the threshold passes.
    pub keep_alive_timeout: Duration,
    /// Largest payload put into a single frame. Must not exceed
    /// `max_receive_buffer`, nor `max_stream_buffer` while the stream buffer
    /// is enabled.
    pub max_frame_size: usize,
    /// Session-wide cap on received-but-unread bytes.
    pub max_receive_buffer: usize,
    /// Enables the per-stream receive cap (and per-stream windows in v2).
    /// In v2 both peers must agree on it.
    pub enable_stream_buffer: bool,
    /// Per-stream cap on received-but-unread bytes. In v2 this is the window
    /// advertised to the peer when a stream is opened or accepted.
    pub max_stream_buffer: usize,
    /// How long after construction the writer coalesces frames before
    /// flushing.
    pub boost_timeout: Duration,
    pub enable_keep_alive: bool,
    /// Number of peer-opened streams that may wait for `accept_stream`.
    pub accept_backlog: usize,
    /// Capacity of the outbound frame queue shared by all streams.
    pub write_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            keep_alive_interval: Duration::from_secs(20),
            keep_alive_interval_max: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_millis(5500),
            max_frame_size: 4096,
            max_receive_buffer: 16 * 1024 * 1024, // 16MB
            enable_stream_buffer: true,
            max_stream_buffer: 1024 * 1024, // 1MB
            boost_timeout: Duration::from_secs(10),
            enable_keep_alive: true,
            accept_backlog: 1024,
            write_queue_size: 1024,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 && self.version != 2 {
            return Err(SmuxError::InvalidConfig(format!(
                "Unsupported protocol version {}",
                self.version
            )));
        }

        if self.keep_alive_interval.is_zero() {
            return Err(SmuxError::InvalidConfig(
                "Keep-alive interval must be positive".to_string(),
            ));
        }

        if self.keep_alive_interval_max < self.keep_alive_interval {
            return Err(SmuxError::InvalidConfig(
                "Keep-alive interval max must not be less than keep-alive interval".to_string(),
            ));
        }

        if self.keep_alive_interval <= self.keep_alive_timeout {
            return Err(SmuxError::InvalidConfig(
                "Keep-alive interval must be greater than keep-alive timeout".to_string(),
            ));
        }

        if self.max_frame_size == 0 {
            return Err(SmuxError::InvalidConfig(
                "Max frame size must be positive".to_string(),
            ));
        }

        if self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(SmuxError::InvalidConfig(format!(
                "Max frame size must not be larger than {MAX_FRAME_SIZE_LIMIT}"
            )));
        }

        if self.max_receive_buffer == 0 {
            return Err(SmuxError::InvalidConfig(
                "Max receive buffer must be positive".to_string(),
            ));
        }

        if self.max_stream_buffer == 0 {
            return Err(SmuxError::InvalidConfig(
                "Max stream buffer must be positive".to_string(),
            ));
        }

        // A frame has to fit into an empty buffer.
        if self.max_frame_size > self.max_receive_buffer {
            return Err(SmuxError::InvalidConfig(
                "Max frame size must not exceed max receive buffer".to_string(),
            ));
        }

        if self.enable_stream_buffer && self.max_frame_size > self.max_stream_buffer {
            return Err(SmuxError::InvalidConfig(
                "Max frame size must not exceed max stream buffer".to_string(),
            ));
        }

        if self.accept_backlog == 0 || self.write_queue_size == 0 {
            return Err(SmuxError::InvalidConfig(
                "Queue capacities must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether inbound data is bounded per stream by `max_stream_buffer`.
    pub(crate) fn per_stream_cap(&self) -> bool {
        self.enable_stream_buffer
    }

    /// Whether streams exchange UPD frames and block writers on the peer's
    /// advertised window.
    pub(crate) fn windowed(&self) -> bool {
        self.version >= 2 && self.enable_stream_buffer
    }
}

/// Builder for creating custom `Config` instances.
///
/// `ConfigBuilder` starts from [`Config::default`] and allows selective
/// overriding of specific settings; [`ConfigBuilder::build`] validates the
/// result.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn keep_alive_interval_max(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval_max = interval;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_receive_buffer(mut self, size: usize) -> Self {
        self.config.max_receive_buffer = size;
        self
    }

    pub fn enable_stream_buffer(mut self, enable: bool) -> Self {
        self.config.enable_stream_buffer = enable;
        self
    }

    pub fn max_stream_buffer(mut self, size: usize) -> Self {
        self.config.max_stream_buffer = size;
        self
    }

    pub fn boost_timeout(mut self, timeout: Duration) -> Self {
        self.config.boost_timeout = timeout;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn write_queue_size(mut self, size: usize) -> Self {
        self.config.write_queue_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
