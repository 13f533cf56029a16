use crate::protocol::MAX_INLINE_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Extra descriptors reserved in the event loop beyond `max_clients`
/// (listener, stdio, log files, ...).
pub const FDSET_RESERVED: usize = 128;

/// Upper bound on automatically chosen I/O read shards.
pub const MAX_AUTO_IO_THREADS: usize = 8;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Maximum number of simultaneously connected clients
    pub max_clients: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// SO_KEEPALIVE on accepted sockets
    pub tcp_keepalive: bool,

    /// Number of read shards for the async read dispatcher.
    /// 0 = auto-detect from the CPU count, 1 = reads stay on the reactor thread.
    pub io_threads: usize,

    /// Minimum CPU count before auto-detection enables the dispatcher
    pub io_threads_min_cpus: usize,

    /// Pin dispatcher worker threads to CPUs (Linux only)
    pub io_threads_cpu_affinity: bool,

    /// Maximum unconsumed input buffered per client, in bytes
    pub max_query_buffer: usize,

    /// Maximum pending reply bytes per client (0 = unlimited)
    pub max_reply_buffer: usize,

    /// Close clients idle for longer than this many seconds (0 = never)
    pub client_idle_timeout_secs: u64,

    /// Server cron frequency, in runs per second
    pub cron_hz: u32,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 6379,
            max_clients: 10_000,
            tcp_nodelay: true,
            tcp_keepalive: true,
            io_threads: 0,
            io_threads_min_cpus: 4,
            io_threads_cpu_affinity: false,
            max_query_buffer: 1024 * 1024 * 1024, // 1GB
            max_reply_buffer: 256 * 1024 * 1024, // 256MB
            client_idle_timeout_secs: 0,
            cron_hz: 10,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use roma_server::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("roma.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_clients == 0 {
            anyhow::bail!("max_clients must be > 0");
        }

        if self.max_query_buffer < MAX_INLINE_SIZE {
            anyhow::bail!("max_query_buffer must be >= {}", MAX_INLINE_SIZE);
        }

        if self.cron_hz == 0 || self.cron_hz > 500 {
            anyhow::bail!("cron_hz must be between 1 and 500");
        }

        if self.io_threads_min_cpus == 0 {
            anyhow::bail!("io_threads_min_cpus must be > 0");
        }

        Ok(())
    }

    /// Number of descriptor slots the event loop needs.
    pub fn event_loop_set_size(&self) -> usize {
        self.max_clients + FDSET_RESERVED
    }

    /// Resolve `io_threads` against the given CPU count.
    ///
    /// Returns the number of read shards, shard 0 being the reactor thread.
    /// A result of 1 means the dispatcher stays off.
    pub fn resolve_io_threads(&self, cpus: usize) -> usize {
        match self.io_threads {
            0 if cpus >= self.io_threads_min_cpus => cpus.min(MAX_AUTO_IO_THREADS),
            0 => 1,
            n => n,
        }
    }
}
