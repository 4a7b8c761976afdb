//! POSIX shared-memory segment shared by exactly one launcher and one
//! worker process.
//!
//! The segment starts with a small table of contents mapping fixed keys
//! to chunks: the control block, the work payload, the opaque context
//! snapshot, and the result queue. The creator names the object
//! `/bgq-<pid>-<seq>-<rand>` and unlinks it as soon as the worker has
//! attached, so the mapping disappears with the last process holding it.

use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::control::ControlBlock;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::debug_log;

pub(crate) const SEG_MAGIC: u64 = 0x6267_715f_7365_6731; // "bgq_seg1"

pub(crate) const KEY_CONTROL: u32 = 0;
pub(crate) const KEY_WORK: u32 = 1;
pub(crate) const KEY_CONTEXT: u32 = 2;
pub(crate) const KEY_QUEUE: u32 = 3;
const NKEYS: usize = 4;

/// Chunks start on 64-byte boundaries so each begins a fresh cache line
/// and keeps 8-byte alignment for the atomic headers.
const CHUNK_ALIGN: usize = 64;

#[repr(C)]
struct TocHeader {
    magic: u64,
    nchunks: u32,
    _pad: u32,
}

#[repr(C)]
struct TocEntry {
    key: u32,
    _pad: u32,
    offset: u64,
    len: u64,
}

const TOC_SIZE: usize = std::mem::size_of::<TocHeader>() + NKEYS * std::mem::size_of::<TocEntry>();

fn align_up(n: usize) -> usize {
    (n + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1)
}

fn errno_message(op: &str) -> String {
    format!("{op} failed: {}", std::io::Error::last_os_error())
}

/// One mapped shared-memory segment. Not `Send`: it belongs to the
/// session (or worker) that mapped it.
pub struct Segment {
    name: String,
    ptr: *mut u8,
    len: usize,
    created: bool,
    unlinked: bool,
    pinned: bool,
    released: bool,
    on_detach: Option<Box<dyn FnOnce()>>,
}

impl Segment {
    /// Creates, sizes, and maps a fresh segment, laying out the table of
    /// contents and all four chunks.
    pub fn create(
        owner_id: u32,
        cookie: u64,
        work: &[u8],
        context: &[u8],
        queue_size: usize,
    ) -> Result<Segment> {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let control_off = align_up(TOC_SIZE);
        let work_off = align_up(control_off + ControlBlock::SIZE);
        let context_off = align_up(work_off + work.len());
        let queue_off = align_up(context_off + context.len());
        let total = queue_off + queue_size;

        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        // O_EXCL can lose to a leftover object from a crashed process with
        // the same pid; retry under a different name.
        let (name, fd) = {
            let mut attempt = 0u32;
            loop {
                let mut entropy = [0u8; 4];
                getrandom::getrandom(&mut entropy).map_err(|e| {
                    Error::ResourceExhausted(format!("segment name entropy: {e}"))
                })?;
                let rand = u32::from_le_bytes(entropy);
                let name = format!("/bgq-{}-{}-{:x}", std::process::id(), seq, rand);
                let cname = CString::new(name.clone())
                    .map_err(|_| Error::ResourceExhausted("segment name".to_string()))?;
                let fd = unsafe {
                    libc::shm_open(
                        cname.as_ptr(),
                        libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                        0o600,
                    )
                };
                if fd >= 0 {
                    break (name, fd);
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EEXIST) && attempt < 16 {
                    attempt += 1;
                    continue;
                }
                return Err(Error::ResourceExhausted(format!("shm_open failed: {err}")));
            }
        };

        let mapped = unsafe {
            if libc::ftruncate(fd, total as libc::off_t) != 0 {
                let msg = errno_message("ftruncate");
                libc::close(fd);
                libc::shm_unlink(CString::new(name.clone()).unwrap_or_default().as_ptr());
                return Err(Error::ResourceExhausted(msg));
            }
            let p = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if p == libc::MAP_FAILED {
                let msg = errno_message("mmap");
                libc::shm_unlink(CString::new(name.clone()).unwrap_or_default().as_ptr());
                return Err(Error::ResourceExhausted(msg));
            }
            p.cast::<u8>()
        };

        let chunks = [
            (KEY_CONTROL, control_off, ControlBlock::SIZE),
            (KEY_WORK, work_off, work.len()),
            (KEY_CONTEXT, context_off, context.len()),
            (KEY_QUEUE, queue_off, queue_size),
        ];
        unsafe {
            let hdr = mapped.cast::<TocHeader>();
            (*hdr).magic = SEG_MAGIC;
            (*hdr).nchunks = NKEYS as u32;
            let entries = mapped
                .add(std::mem::size_of::<TocHeader>())
                .cast::<TocEntry>();
            for (i, (key, off, len)) in chunks.iter().enumerate() {
                let e = entries.add(i);
                (*e).key = *key;
                (*e)._pad = 0;
                (*e).offset = *off as u64;
                (*e).len = *len as u64;
            }
            ControlBlock::init_at(mapped.add(control_off), owner_id, cookie);
            std::ptr::copy_nonoverlapping(work.as_ptr(), mapped.add(work_off), work.len());
            std::ptr::copy_nonoverlapping(context.as_ptr(), mapped.add(context_off), context.len());
            Queue::init(mapped.add(queue_off), queue_size);
        }

        Ok(Segment {
            name,
            ptr: mapped,
            len: total,
            created: true,
            unlinked: false,
            pinned: false,
            released: false,
            on_detach: None,
        })
    }

    /// Maps an existing segment by name and validates its layout.
    pub fn attach(name: &str) -> Result<Segment> {
        let cname = CString::new(name)
            .map_err(|_| Error::InvalidParameter("segment name contains NUL".to_string()))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::ResourceExhausted(errno_message("shm_open")));
        }
        let (ptr, len) = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                let msg = errno_message("fstat");
                libc::close(fd);
                return Err(Error::ResourceExhausted(msg));
            }
            let len = st.st_size as usize;
            let p = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if p == libc::MAP_FAILED {
                return Err(Error::ResourceExhausted(errno_message("mmap")));
            }
            (p.cast::<u8>(), len)
        };
        let seg = Segment {
            name: name.to_string(),
            ptr,
            len,
            created: false,
            unlinked: false,
            pinned: false,
            released: false,
            on_detach: None,
        };
        seg.validate()?;
        Ok(seg)
    }

    fn validate(&self) -> Result<()> {
        if self.len < TOC_SIZE {
            return Err(Error::ProtocolViolation(
                "segment too small for its table of contents".to_string(),
            ));
        }
        let hdr = unsafe { &*self.ptr.cast::<TocHeader>() };
        if hdr.magic != SEG_MAGIC {
            return Err(Error::ProtocolViolation(
                "bad magic number in shared segment".to_string(),
            ));
        }
        if hdr.nchunks != NKEYS as u32 {
            return Err(Error::ProtocolViolation(format!(
                "segment holds {} chunks, expected {NKEYS}",
                hdr.nchunks
            )));
        }
        for key in [KEY_CONTROL, KEY_WORK, KEY_CONTEXT, KEY_QUEUE] {
            self.chunk(key)?;
        }
        // Control and queue carry their own magics; check them here so a
        // torn or foreign segment is rejected at attach time.
        let (ctl_ptr, ctl_len) = self.chunk(KEY_CONTROL)?;
        if unsafe { ControlBlock::from_chunk(ctl_ptr, ctl_len) }.is_none() {
            return Err(Error::ProtocolViolation(
                "bad magic number in control block".to_string(),
            ));
        }
        let (q_ptr, q_len) = self.chunk(KEY_QUEUE)?;
        unsafe { Queue::from_chunk(q_ptr, q_len) }?;
        Ok(())
    }

    fn chunk(&self, key: u32) -> Result<(*mut u8, usize)> {
        if self.released {
            return Err(Error::ProtocolViolation(
                "segment already detached".to_string(),
            ));
        }
        let entries = unsafe {
            std::slice::from_raw_parts(
                self.ptr
                    .add(std::mem::size_of::<TocHeader>())
                    .cast::<TocEntry>(),
                NKEYS,
            )
        };
        for e in entries {
            if e.key != key {
                continue;
            }
            let off = e.offset as usize;
            let len = e.len as usize;
            if off.checked_add(len).map_or(true, |end| end > self.len) {
                return Err(Error::ProtocolViolation(format!(
                    "chunk {key} extends past the end of the segment"
                )));
            }
            return Ok((unsafe { self.ptr.add(off) }, len));
        }
        Err(Error::ProtocolViolation(format!(
            "segment has no chunk with key {key}"
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> Result<&ControlBlock> {
        let (ptr, len) = self.chunk(KEY_CONTROL)?;
        unsafe { ControlBlock::from_chunk(ptr, len) }.ok_or_else(|| {
            Error::ProtocolViolation("bad magic number in control block".to_string())
        })
    }

    pub fn work(&self) -> Result<&[u8]> {
        let (ptr, len) = self.chunk(KEY_WORK)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    pub fn context(&self) -> Result<&[u8]> {
        let (ptr, len) = self.chunk(KEY_CONTEXT)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    pub fn queue(&self) -> Result<Queue<'_>> {
        let (ptr, len) = self.chunk(KEY_QUEUE)?;
        unsafe { Queue::from_chunk(ptr, len) }
    }

    /// Marks the mapping as surviving the call that created it. Purely a
    /// session-side bookkeeping bit; unpin before release.
    pub fn pin(&mut self) {
        self.pinned = true;
    }

    pub fn unpin(&mut self) {
        self.pinned = false;
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Registers a hook to run exactly once when the segment detaches.
    pub fn on_detach(&mut self, f: Box<dyn FnOnce()>) {
        self.on_detach = Some(f);
    }

    /// Removes the name from the namespace. Creator-only; the mapping
    /// stays valid in every process that already attached.
    pub fn unlink(&mut self) {
        if !self.created || self.unlinked {
            return;
        }
        self.unlinked = true;
        if let Ok(cname) = CString::new(self.name.clone()) {
            if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
                debug_log(&errno_message("shm_unlink"));
            }
        }
    }

    /// Unmaps the segment and fires the detach hook. Idempotent.
    pub fn detach(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.unlink();
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            debug_log(&errno_message("munmap"));
        }
        if let Some(hook) = self.on_detach.take() {
            hook();
        }
    }

    #[cfg(test)]
    pub(crate) fn min_total_size(work_len: usize, context_len: usize, queue_size: usize) -> usize {
        let control_off = align_up(TOC_SIZE);
        let work_off = align_up(control_off + ControlBlock::SIZE);
        let context_off = align_up(work_off + work_len);
        align_up(context_off + context_len) + queue_size
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn create_attach_roundtrip() {
        let seg = Segment::create(7, 0xabcd, b"do the thing", b"ctx", 4096).unwrap();
        let other = Segment::attach(seg.name()).unwrap();
        assert_eq!(other.work().unwrap(), b"do the thing");
        assert_eq!(other.context().unwrap(), b"ctx");
        let ctl = other.control().unwrap();
        assert_eq!(ctl.owner_id(), 7);
        assert_eq!(ctl.cookie(), 0xabcd);
        // Cancel raised on one mapping is visible on the other.
        ctl.request_cancel();
        assert!(seg.control().unwrap().cancel_requested());
    }

    #[test]
    fn fresh_segments_get_distinct_names() {
        let a = Segment::create(1, 2, b"w", b"", 4096).unwrap();
        let b = Segment::create(1, 2, b"w", b"", 4096).unwrap();
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("/bgq-"));
    }

    #[test]
    fn queue_spans_both_mappings() {
        let seg = Segment::create(1, 2, b"w", b"", 4096).unwrap();
        let other = Segment::attach(seg.name()).unwrap();
        other.queue().unwrap().try_send(b"hello").unwrap();
        assert_eq!(
            seg.queue().unwrap().try_recv().unwrap(),
            crate::queue::RecvStatus::Msg(b"hello".to_vec())
        );
    }

    #[test]
    fn detach_is_idempotent_and_accessors_fail_after() {
        let mut seg = Segment::create(1, 2, b"w", b"", 2048).unwrap();
        seg.detach();
        seg.detach();
        assert!(seg.work().is_err());
        assert!(seg.queue().is_err());
    }

    #[test]
    fn detach_hook_fires_exactly_once() {
        let fired = Rc::new(Cell::new(0u32));
        let mut seg = Segment::create(1, 2, b"w", b"", 2048).unwrap();
        let counter = Rc::clone(&fired);
        seg.on_detach(Box::new(move || counter.set(counter.get() + 1)));
        seg.detach();
        seg.detach();
        drop(seg);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn unlinked_name_cannot_be_attached_again() {
        let mut seg = Segment::create(1, 2, b"w", b"", 2048).unwrap();
        let name = seg.name().to_string();
        seg.unlink();
        assert!(Segment::attach(&name).is_err());
        // The live mapping still works.
        assert_eq!(seg.work().unwrap(), b"w");
    }

    #[test]
    fn pin_bookkeeping() {
        let mut seg = Segment::create(1, 2, b"w", b"", 2048).unwrap();
        assert!(!seg.is_pinned());
        seg.pin();
        assert!(seg.is_pinned());
        seg.unpin();
        assert!(!seg.is_pinned());
    }

    #[test]
    fn queue_carries_frames_between_threads() {
        // A Segment is not Send, so the sender thread attaches its own
        // mapping by name, like a worker process would.
        let seg = Segment::create(1, 2, b"w", b"", 8192).unwrap();
        let name = seg.name().to_string();
        let sender = std::thread::spawn(move || {
            let other = Segment::attach(&name).unwrap();
            let q = other.queue().unwrap();
            q.attach_sender();
            for i in 0u32..200 {
                let msg = i.to_le_bytes();
                loop {
                    match q.try_send(&msg).unwrap() {
                        crate::queue::SendStatus::Sent => break,
                        crate::queue::SendStatus::Full => std::thread::yield_now(),
                        crate::queue::SendStatus::Detached => panic!("receiver vanished"),
                    }
                }
            }
            q.detach_sender();
        });
        let q = seg.queue().unwrap();
        let mut next = 0u32;
        loop {
            match q.try_recv().unwrap() {
                crate::queue::RecvStatus::Msg(frame) => {
                    assert_eq!(frame, next.to_le_bytes());
                    next += 1;
                }
                crate::queue::RecvStatus::Empty => std::thread::yield_now(),
                crate::queue::RecvStatus::Detached => break,
            }
        }
        assert_eq!(next, 200);
        sender.join().unwrap();
    }

    #[test]
    fn layout_keeps_chunks_aligned() {
        let total = Segment::min_total_size(13, 7, 4096);
        assert_eq!((total - 4096) % CHUNK_ALIGN, 0);
    }
}
