use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub(crate) const CONTROL_MAGIC: u64 = 0x6267_715f_6374_6c31; // "bgq_ctl1"

/// Fixed-layout coordination block at the head of the shared segment.
///
/// Every field has exactly one writer role, so no field needs a lock:
/// the launcher writes the identity fields once before the worker is
/// spawned; `cancel_requested` is write-once-monotonic (either side may
/// raise it, nobody lowers it); the progress fields are worker-only.
#[repr(C)]
pub struct ControlBlock {
    magic: u64,
    owner_id: u32,
    _pad: u32,
    cookie: u64,
    cancel_requested: AtomicU32,
    _pad2: u32,
    rows_emitted: AtomicU64,
    last_activity_unix_ms: AtomicU64,
}

impl ControlBlock {
    pub(crate) const SIZE: usize = std::mem::size_of::<ControlBlock>();

    /// Writes the launcher-owned fields into freshly zeroed segment memory.
    ///
    /// # Safety
    /// `ptr` must point at `SIZE` writable, zero-initialized bytes that are
    /// 8-aligned and not yet visible to any other process.
    pub(crate) unsafe fn init_at(ptr: *mut u8, owner_id: u32, cookie: u64) {
        let block = ptr.cast::<ControlBlock>();
        (*block).magic = CONTROL_MAGIC;
        (*block).owner_id = owner_id;
        (*block).cookie = cookie;
    }

    /// Reinterprets a segment chunk as a control block.
    ///
    /// # Safety
    /// `ptr` must point at `len >= SIZE` bytes of a live shared mapping,
    /// 8-aligned, previously initialized by `init_at`.
    pub(crate) unsafe fn from_chunk<'a>(ptr: *const u8, len: usize) -> Option<&'a ControlBlock> {
        if len < Self::SIZE {
            return None;
        }
        let block = &*ptr.cast::<ControlBlock>();
        if block.magic != CONTROL_MAGIC {
            return None;
        }
        Some(block)
    }

    pub fn owner_id(&self) -> u32 {
        self.owner_id
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Raises the cancel flag. Monotonic: there is no way to lower it.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(1, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire) != 0
    }

    pub fn note_row_emitted(&self) {
        self.rows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now_unix_ms: u64) {
        self.last_activity_unix_ms.store(now_unix_ms, Ordering::Relaxed);
    }

    pub fn last_activity_unix_ms(&self) -> u64 {
        self.last_activity_unix_ms.load(Ordering::Relaxed)
    }
}
