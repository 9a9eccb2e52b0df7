//! Command line arguments of the binaries.

use std::time::Duration;

use crate::node::NodeOptions;
use crate::transport::{ConnectPolicy, RetryPolicy};

pub mod ctl;
pub mod node;

/// Run tuning shared by every binary that starts nodes.
#[derive(clap::Args, Debug, Clone)]
pub struct Tuning {
    /// Records queued for one peer before they are sent
    #[clap(short, long, default_value_t = 1000)]
    pub batch_size: usize,
    /// Encoded bytes queued for one peer before they are sent (MiB)
    #[clap(long, default_value_t = 64)]
    pub batch_mib: usize,
    /// Delay between dial attempts to peers that are not up yet (ms)
    #[clap(short, long, default_value_t = 300)]
    pub retry_interval: u64,
    /// Give up on unreachable peers after this many seconds (default: never)
    #[clap(short = 't', long)]
    pub connect_timeout: Option<u64>,
    /// Attempts per batch before a send failure is fatal
    #[clap(long, default_value_t = 3)]
    pub send_attempts: u32,
    /// Delay before the first batch resend, doubled on each retry (ms)
    #[clap(long, default_value_t = 100)]
    pub send_backoff: u64,
}

impl Tuning {
    pub fn options(&self) -> NodeOptions {
        NodeOptions {
            batch_size: self.batch_size,
            batch_bytes: self.batch_mib.saturating_mul(1024 * 1024),
            connect: ConnectPolicy {
                retry_interval: Duration::from_millis(self.retry_interval),
                timeout: self.connect_timeout.map(Duration::from_secs),
            },
            send: RetryPolicy {
                attempts: self.send_attempts,
                backoff: Duration::from_millis(self.send_backoff),
            },
        }
    }
}
