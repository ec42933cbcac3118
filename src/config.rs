//! Runtime configuration for the server and client.
//!
//! Both configs derive [`clap::Args`] so the binaries can flatten them straight into their
//! command lines; the `Default` impls carry the same values as the command-line defaults.
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::Args;

use crate::protocol::{
    MESSAGE_RETRY, MAX_CONNECT_RETRY, PoolOptions, RetryPolicy, SOCKET_RETRY, SOCKET_STEP,
};

pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_WORKERS: usize = 4;

const DEFAULT_STALL_BACKOFF_US: u64 = 100;
const DEFAULT_IDLE_BACKOFF_US: u64 = 1_000;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1_000;

/// Limits for a single send or receive on a socket.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TransferConfig {
    /// Zero-byte transfers tolerated in a row before a socket is treated as failed
    #[arg(long, default_value_t = MESSAGE_RETRY)]
    pub stall_retries: u32,

    /// Pause after a zero-byte transfer, in microseconds
    #[arg(long, default_value_t = DEFAULT_STALL_BACKOFF_US)]
    pub stall_backoff_us: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            stall_retries: MESSAGE_RETRY,
            stall_backoff_us: DEFAULT_STALL_BACKOFF_US,
        }
    }
}

impl TransferConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            stall_retries: self.stall_retries,
            stall_backoff: Duration::from_micros(self.stall_backoff_us),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))]
    pub listen: SocketAddr,

    /// Most worker threads serving connections at once
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub max_threads: usize,

    /// Sockets checked per poll call
    #[arg(long, default_value_t = SOCKET_STEP)]
    pub socket_step: usize,

    /// Pause before rescheduling a connection that had nothing to read, in microseconds
    #[arg(long, default_value_t = DEFAULT_IDLE_BACKOFF_US)]
    pub idle_backoff_us: u64,

    /// Interval between queue checks while shutting down, in milliseconds
    #[arg(long, default_value_t = DEFAULT_DRAIN_INTERVAL_MS)]
    pub drain_interval_ms: u64,

    #[command(flatten)]
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_threads: DEFAULT_WORKERS,
            socket_step: SOCKET_STEP,
            idle_backoff_us: DEFAULT_IDLE_BACKOFF_US,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            transfer: TransferConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ClientConfig {
    /// Server to connect to
    #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))]
    pub server: SocketAddr,

    /// Sockets opened to the server up front
    #[arg(long, default_value_t = 1)]
    pub sockets: usize,

    /// Connect attempts per socket
    #[arg(long, default_value_t = MAX_CONNECT_RETRY)]
    pub connect_retries: u32,

    /// Attempts per request before a call fails
    #[arg(long, default_value_t = SOCKET_RETRY)]
    pub call_retries: u32,

    #[command(flatten)]
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            sockets: 1,
            connect_retries: MAX_CONNECT_RETRY,
            call_retries: SOCKET_RETRY,
            transfer: TransferConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            sockets: self.sockets,
            connect_retries: self.connect_retries,
            transfer: self.transfer.policy(),
        }
    }
}
