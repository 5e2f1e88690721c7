//! Configuration for the multiplexer
//!
//! CLI arguments and environment variable handling using clap.
//! Every conductor index `i` maps to three ports: the local endpoint UI
//! clients connect to, the conductor's app interface, and its admin interface,
//! each derived as `base + i`.

use clap::{ArgAction, Parser};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default number of pooled upstream connections per conductor
pub const DEFAULT_POOL_SIZE: usize = 10;

/// hc-multiplexer - share pooled conductor app connections between UI clients
#[derive(Parser, Debug, Clone)]
#[command(name = "hc-multiplexer")]
#[command(about = "WebSocket multiplexer for Holochain conductor app interfaces")]
pub struct Args {
    /// Number of conductors to proxy (indices 0..N-1)
    #[arg(long, env = "CONDUCTOR_COUNT", default_value = "1")]
    pub conductor_count: usize,

    /// Host to bind local endpoints on
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Local endpoint for conductor i listens on LOCAL_BASE_PORT + i
    #[arg(long, env = "LOCAL_BASE_PORT", default_value = "3100")]
    pub local_base_port: u16,

    /// Host the conductors run on
    #[arg(long, env = "UPSTREAM_HOST", default_value = "127.0.0.1")]
    pub upstream_host: String,

    /// App interface for conductor i is at UPSTREAM_BASE_PORT + i
    #[arg(long, env = "UPSTREAM_BASE_PORT", default_value = "3030")]
    pub upstream_base_port: u16,

    /// Admin interface for conductor i is at ADMIN_BASE_PORT + i
    #[arg(long, env = "ADMIN_BASE_PORT", default_value = "4444")]
    pub admin_base_port: u16,

    /// Ask each conductor to attach its app interface at startup
    #[arg(long, env = "ATTACH_INTERFACES", default_value = "true", action = ArgAction::Set)]
    pub attach_interfaces: bool,

    /// Target number of upstream connections per conductor
    #[arg(long, env = "POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "15000")]
    pub connect_timeout_ms: u64,

    /// Drop pending requests that got no response after this many seconds (0 = never)
    #[arg(long, env = "PENDING_TTL_SECS", default_value = "300")]
    pub pending_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

/// Everything one conductor shard needs, derived from [`Args`]
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Conductor index
    pub conductor: usize,
    /// Local endpoint UI clients connect to
    pub listen: SocketAddr,
    /// Conductor app interface URL (upstream pool target)
    pub upstream_url: String,
    /// Conductor admin interface URL (collaborator call target)
    pub admin_url: String,
    /// App interface port, as told to the admin interface
    pub upstream_port: u16,
    /// Target pool size
    pub pool_size: usize,
    /// Upstream dial timeout
    pub connect_timeout: Duration,
    /// Pending request TTL, `None` keeps entries forever
    pub pending_ttl: Option<Duration>,
}

impl ShardConfig {
    /// Config for a shard talking to an explicit upstream URL (tests, embedding)
    pub fn new(conductor: usize, listen: SocketAddr, upstream_url: impl Into<String>) -> Self {
        Self {
            conductor,
            listen,
            upstream_url: upstream_url.into(),
            admin_url: String::new(),
            upstream_port: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_millis(15_000),
            pending_ttl: None,
        }
    }
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.conductor_count == 0 {
            return Err("CONDUCTOR_COUNT must be at least 1".to_string());
        }

        if self.pool_size == 0 {
            return Err("POOL_SIZE must be at least 1".to_string());
        }

        for (name, base) in [
            ("LOCAL_BASE_PORT", self.local_base_port),
            ("UPSTREAM_BASE_PORT", self.upstream_base_port),
            ("ADMIN_BASE_PORT", self.admin_base_port),
        ] {
            if offset_port(base, self.conductor_count - 1).is_none() {
                return Err(format!(
                    "{} {} + {} conductors exceeds the port range",
                    name, base, self.conductor_count
                ));
            }
        }

        Ok(())
    }

    /// Derive the shard config for conductor `conductor`
    ///
    /// Only valid after [`Args::validate`] succeeded.
    pub fn shard_config(&self, conductor: usize) -> Result<ShardConfig, String> {
        let local_port = offset_port(self.local_base_port, conductor)
            .ok_or_else(|| format!("no local port for conductor {}", conductor))?;
        let upstream_port = offset_port(self.upstream_base_port, conductor)
            .ok_or_else(|| format!("no upstream port for conductor {}", conductor))?;
        let admin_port = offset_port(self.admin_base_port, conductor)
            .ok_or_else(|| format!("no admin port for conductor {}", conductor))?;

        Ok(ShardConfig {
            conductor,
            listen: SocketAddr::new(self.listen_host, local_port),
            upstream_url: format!("ws://{}:{}", self.upstream_host, upstream_port),
            admin_url: format!("ws://{}:{}", self.upstream_host, admin_port),
            upstream_port,
            pool_size: self.pool_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            pending_ttl: (self.pending_ttl_secs > 0)
                .then(|| Duration::from_secs(self.pending_ttl_secs)),
        })
    }
}

fn offset_port(base: u16, index: usize) -> Option<u16> {
    u16::try_from(index).ok().and_then(|i| base.checked_add(i))
}
