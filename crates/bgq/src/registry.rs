//! Per-session bookkeeping of launched workers, keyed by pid.
//!
//! The registry is shared between the session and the detach hooks of
//! the segments it holds, through a weak reference. A hook firing while
//! the session itself is being torn down finds the weak reference dead
//! and does nothing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::segment::Segment;
use crate::supervisor::WorkerProcess;
use crate::{debug_log, Handle, OwnerId, LAST_ERROR_LEN};

pub(crate) struct WorkerEntry {
    pub(crate) handle: Handle,
    pub(crate) owner_id: OwnerId,
    /// Taken out before any detach so the hook can drop the entry safely.
    pub(crate) seg: Option<Segment>,
    pub(crate) process: WorkerProcess,
    pub(crate) queue_size: u32,
    pub(crate) consumed: bool,
    pub(crate) result_disabled: bool,
    pub(crate) canceled: bool,
    pub(crate) started_at_unix_ms: u64,
    /// Launcher-side receive timestamp, refreshed per drained frame.
    pub(crate) last_msg_unix_ms: u64,
    pub(crate) last_error: Option<String>,
    pub(crate) work_preview: String,
}

impl WorkerEntry {
    /// Records a terminal error, truncated to a bounded suffix of the
    /// entry, so listings stay cheap.
    pub(crate) fn record_error(&mut self, err: &Error) {
        let mut msg = err.to_string();
        if msg.len() > LAST_ERROR_LEN {
            let mut cut = LAST_ERROR_LEN;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
        }
        self.last_error = Some(msg);
    }
}

#[derive(Clone)]
pub(crate) struct Registry {
    inner: Rc<RefCell<HashMap<u32, WorkerEntry>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            inner: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        self.inner.borrow().keys().copied().collect()
    }

    /// Removes and returns the entry so the caller can detach its segment
    /// without the map borrowed.
    pub(crate) fn take(&self, pid: u32) -> Option<WorkerEntry> {
        self.inner.borrow_mut().remove(&pid)
    }

    pub(crate) fn put(&self, entry: WorkerEntry) {
        self.inner.borrow_mut().insert(entry.handle.pid, entry);
    }

    pub(crate) fn with_entry_mut<T>(
        &self,
        pid: u32,
        f: impl FnOnce(&mut WorkerEntry) -> T,
    ) -> Option<T> {
        self.inner.borrow_mut().get_mut(&pid).map(f)
    }

    /// Removes a pid's entry if present. Absence is benign: the detach
    /// hook and an explicit detach may both get here.
    pub(crate) fn cleanup(&self, pid: u32) {
        if self.inner.borrow_mut().remove(&pid).is_none() {
            debug_log(&format!("registry entry for pid {pid} already removed"));
        }
    }

    /// Registers a freshly launched worker. A pid collision against a
    /// live entry of a different owner means the OS recycled a pid we
    /// still track for someone else; that breaks every identity
    /// assumption, so it poisons the whole session. A collision within
    /// the same owner just replaces the stale entry.
    pub(crate) fn save(&self, mut entry: WorkerEntry) -> Result<()> {
        let pid = entry.handle.pid;
        if let Some(old) = self.take(pid) {
            if old.owner_id != entry.owner_id {
                self.put(old);
                if let Some(mut seg) = entry.seg.take() {
                    seg.detach();
                }
                return Err(Error::IntegrityViolation(format!(
                    "pid {pid} is already registered to a different owner"
                )));
            }
            debug_log(&format!("replacing stale registry entry for pid {pid}"));
            self.dispose(old);
        }
        self.register_hook(&mut entry);
        self.put(entry);
        Ok(())
    }

    /// Drops an entry, detaching its segment with the hook disarmed so
    /// the removal does not recurse into the map.
    pub(crate) fn dispose(&self, mut entry: WorkerEntry) {
        if let Some(mut seg) = entry.seg.take() {
            seg.detach();
        }
    }

    fn register_hook(&self, entry: &mut WorkerEntry) {
        let weak: Weak<RefCell<HashMap<u32, WorkerEntry>>> = Rc::downgrade(&self.inner);
        let pid = entry.handle.pid;
        if let Some(seg) = entry.seg.as_mut() {
            seg.on_detach(Box::new(move || {
                // During session teardown the upgrade fails and the hook
                // does nothing; the map is being dropped anyway.
                if let Some(inner) = weak.upgrade() {
                    Registry { inner }.cleanup(pid);
                }
            }));
        }
    }
}
