//! Single-producer/single-consumer bounded message queue over one
//! segment chunk.
//!
//! The worker attaches as sender, the launcher as receiver. Frames are a
//! `u32`-LE length followed by the payload, wrapping around the ring.
//! Both operations are non-blocking; blocking behavior is an explicit
//! caller loop with capped backoff, so every wait stays interruptible.

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};

pub(crate) const QUEUE_MAGIC: u64 = 0x6267_715f_6d71_3031; // "bgq_mq01"

/// Frame length prefix, in bytes.
const FRAME_HEADER: u64 = 4;

#[repr(C)]
pub(crate) struct QueueHeader {
    magic: u64,
    capacity: u64,
    /// Total bytes ever written; producer-owned.
    tail: AtomicU64,
    /// Total bytes ever consumed; consumer-owned.
    head: AtomicU64,
    sender_attached: AtomicU32,
    sender_detached: AtomicU32,
    receiver_attached: AtomicU32,
    receiver_detached: AtomicU32,
}

pub(crate) const QUEUE_HEADER_SIZE: usize = std::mem::size_of::<QueueHeader>();

#[derive(Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// Not enough free ring space for the whole frame.
    Full,
    /// The receiver detached; the message was dropped.
    Detached,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvStatus {
    Msg(Vec<u8>),
    Empty,
    /// The sender detached and the ring is drained.
    Detached,
}

/// A borrowed view over the queue chunk of a live segment.
pub struct Queue<'a> {
    hdr: &'a QueueHeader,
    ring: *mut u8,
    cap: usize,
}

impl<'a> Queue<'a> {
    /// Initializes a fresh queue header in zeroed segment memory.
    ///
    /// # Safety
    /// `ptr` must point at `len` writable, zero-initialized, 8-aligned
    /// bytes not yet shared with another process.
    pub(crate) unsafe fn init(ptr: *mut u8, len: usize) {
        debug_assert!(len > QUEUE_HEADER_SIZE);
        let hdr = ptr.cast::<QueueHeader>();
        (*hdr).magic = QUEUE_MAGIC;
        (*hdr).capacity = (len - QUEUE_HEADER_SIZE) as u64;
    }

    /// Builds a view over an initialized queue chunk.
    ///
    /// # Safety
    /// `ptr` must point at `len` bytes of a live shared mapping,
    /// 8-aligned, previously initialized by `init` (in either process).
    pub(crate) unsafe fn from_chunk(ptr: *mut u8, len: usize) -> Result<Queue<'a>> {
        if len <= QUEUE_HEADER_SIZE {
            return Err(Error::ProtocolViolation(
                "queue chunk too small for its header".to_string(),
            ));
        }
        let hdr = &*ptr.cast::<QueueHeader>();
        if hdr.magic != QUEUE_MAGIC {
            return Err(Error::ProtocolViolation(
                "bad magic number in message queue".to_string(),
            ));
        }
        let cap = (len - QUEUE_HEADER_SIZE) as u64;
        if hdr.capacity != cap {
            return Err(Error::ProtocolViolation(format!(
                "queue capacity {} does not match chunk size {}",
                hdr.capacity, cap
            )));
        }
        Ok(Queue {
            hdr,
            ring: ptr.add(QUEUE_HEADER_SIZE),
            cap: cap as usize,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Largest message that can ever fit the ring in one frame.
    pub fn max_message_len(&self) -> usize {
        self.cap - FRAME_HEADER as usize
    }

    pub fn attach_sender(&self) {
        self.hdr.sender_attached.store(1, Ordering::Release);
    }

    pub fn attach_receiver(&self) {
        self.hdr.receiver_attached.store(1, Ordering::Release);
    }

    pub fn detach_sender(&self) {
        self.hdr.sender_detached.store(1, Ordering::Release);
    }

    pub fn detach_receiver(&self) {
        self.hdr.receiver_detached.store(1, Ordering::Release);
    }

    pub fn sender_attached(&self) -> bool {
        self.hdr.sender_attached.load(Ordering::Acquire) != 0
    }

    pub fn sender_detached(&self) -> bool {
        self.hdr.sender_detached.load(Ordering::Acquire) != 0
    }

    pub fn receiver_detached(&self) -> bool {
        self.hdr.receiver_detached.load(Ordering::Acquire) != 0
    }

    /// Non-blocking send of one whole frame. Never writes a partial frame.
    pub fn try_send(&self, msg: &[u8]) -> Result<SendStatus> {
        if msg.len() > self.max_message_len() {
            return Err(Error::InvalidParameter(format!(
                "message of {} bytes cannot fit a queue of {} bytes",
                msg.len(),
                self.cap
            )));
        }
        if self.receiver_detached() {
            return Ok(SendStatus::Detached);
        }
        let head = self.hdr.head.load(Ordering::Acquire);
        let tail = self.hdr.tail.load(Ordering::Relaxed);
        let need = FRAME_HEADER + msg.len() as u64;
        if need > self.cap as u64 - (tail - head) {
            return Ok(SendStatus::Full);
        }
        self.copy_in(tail, &(msg.len() as u32).to_le_bytes());
        self.copy_in(tail + FRAME_HEADER, msg);
        self.hdr.tail.store(tail + need, Ordering::Release);
        Ok(SendStatus::Sent)
    }

    /// Non-blocking receive of one whole frame.
    pub fn try_recv(&self) -> Result<RecvStatus> {
        let head = self.hdr.head.load(Ordering::Relaxed);
        let mut tail = self.hdr.tail.load(Ordering::Acquire);
        if head == tail {
            if !self.sender_detached() {
                return Ok(RecvStatus::Empty);
            }
            // The sender stores data before the detach flag; look again so
            // a final in-flight frame is not lost.
            tail = self.hdr.tail.load(Ordering::Acquire);
            if head == tail {
                return Ok(RecvStatus::Detached);
            }
        }
        let mut len_bytes = [0u8; 4];
        self.copy_out(head, &mut len_bytes);
        let len = u32::from_le_bytes(len_bytes) as u64;
        if len > self.max_message_len() as u64 || head + FRAME_HEADER + len > tail {
            return Err(Error::ProtocolViolation(
                "corrupt frame on result queue".to_string(),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.copy_out(head + FRAME_HEADER, &mut buf);
        self.hdr.head.store(head + FRAME_HEADER + len, Ordering::Release);
        Ok(RecvStatus::Msg(buf))
    }

    fn copy_in(&self, at: u64, src: &[u8]) {
        let off = (at % self.cap as u64) as usize;
        let first = src.len().min(self.cap - off);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ring.add(off), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.ring, src.len() - first);
            }
        }
    }

    fn copy_out(&self, at: u64, dst: &mut [u8]) {
        let off = (at % self.cap as u64) as usize;
        let first = dst.len().min(self.cap - off);
        unsafe {
            ptr::copy_nonoverlapping(self.ring.add(off), dst.as_mut_ptr(), first);
            if first < dst.len() {
                ptr::copy_nonoverlapping(self.ring, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }
}
