//! Hand a unit of work to an ephemeral worker process and stream its
//! result back over a shared-memory message queue.
//!
//! The launcher side lives in [`Session`]; the worker side entry point is
//! [`worker::run_worker`]. Both processes share one [`segment::Segment`]
//! holding a control block, the work payload, an opaque context snapshot,
//! and the result queue.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

mod control;
mod error;
mod queue;
mod registry;
mod result;
mod segment;
mod session;
mod supervisor;
mod wire;
pub mod worker;

pub use control::ControlBlock;
pub use error::{Error, RemoteError, Result};
pub use queue::{Queue, RecvStatus, SendStatus};
pub use result::{ColType, ResultShape, Row, Value};
pub use segment::Segment;
pub use session::{
    EntrySummary, OwnerEquality, RightsPolicy, Session, SessionOptions, WorkerState, WorkerStatus,
};
pub use supervisor::{resolve_worker_bin, ProcessStatus, WorkerProcess};
pub use wire::{ColumnDesc, ErrorFields, Notification};

/// Smallest accepted result-queue size, in bytes (header included).
pub const MIN_QUEUE_SIZE: u32 = 1024;
/// Largest accepted result-queue size, in bytes.
pub const MAX_QUEUE_SIZE: u32 = 16 * 1024 * 1024;
/// Largest accepted work payload, in bytes.
pub const MAX_WORK_LEN: usize = 4 * 1024 * 1024;
/// Hard ceiling on the cancel grace period, to keep duration arithmetic
/// far away from overflow.
pub const GRACE_CEILING_MS: u64 = 3_600_000;

/// Number of characters of the work payload kept for listings.
pub const WORK_PREVIEW_LEN: usize = 120;
/// Number of characters of a worker error kept on the registry entry.
pub const LAST_ERROR_LEN: usize = 256;

pub const ENV_WORKER_BIN: &str = "BGQ_WORKER_BIN";
pub const ENV_DEBUG: &str = "BGQ_DEBUG";
pub const DEFAULT_WORKER_BIN: &str = "bgq-worker";

/// Identity of one worker invocation for its whole lifetime.
///
/// `pid` is reused by the OS over time; `cookie` is a random non-zero
/// 64-bit value chosen at launch that disambiguates pid reuse within one
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Handle {
    pub pid: u32,
    pub cookie: u64,
}

/// Opaque identity that owns a launched worker. Rights checks compare
/// owner ids through a [`RightsPolicy`], never through the cookie.
pub type OwnerId = u32;

pub(crate) fn debug_enabled() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| std::env::var_os(ENV_DEBUG).is_some())
}

pub(crate) fn debug_log(msg: &str) {
    if debug_enabled() {
        eprintln!("bgq: {msg}");
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Poll interval that doubles up to a cap. All blocking loops in this
/// crate are explicit poll loops over this, so they stay responsive to
/// the caller's interrupt flag on every iteration.
pub(crate) struct Backoff {
    initial: Duration,
    cap: Duration,
    cur: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, cap: Duration) -> Self {
        Backoff {
            initial,
            cap,
            cur: initial,
        }
    }

    pub(crate) fn sleep(&mut self) {
        std::thread::sleep(self.cur);
        self.cur = (self.cur * 2).min(self.cap);
    }

    pub(crate) fn reset(&mut self) {
        self.cur = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_micros(1), Duration::from_micros(8));
        assert_eq!(b.cur, Duration::from_micros(1));
        b.sleep();
        assert_eq!(b.cur, Duration::from_micros(2));
        b.sleep();
        b.sleep();
        assert_eq!(b.cur, Duration::from_micros(8));
        b.sleep();
        assert_eq!(b.cur, Duration::from_micros(8));
        b.reset();
        assert_eq!(b.cur, Duration::from_micros(1));
    }

    #[test]
    fn now_unix_ms_is_plausible() {
        // 2020-01-01 in unix ms.
        assert!(now_unix_ms() > 1_577_836_800_000);
    }
}
