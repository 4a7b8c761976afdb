//! Launcher-side session: launch workers, read results, cancel, detach.
//!
//! A session tracks every worker it launched in a pid-keyed registry.
//! Handles carry a per-launch cookie so a recycled pid cannot be mistaken
//! for the worker it used to name. All blocking operations poll with
//! capped backoff and honor the session's interrupt flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::queue::RecvStatus;
use crate::registry::{Registry, WorkerEntry};
use crate::result::{remote_error, DecodeEvent, ResultDecoder, ResultShape, Row};
use crate::segment::Segment;
use crate::supervisor::{resolve_worker_bin, ProcessStatus, WorkerProcess};
use crate::wire::{ErrorFields, Notification};
use crate::{
    debug_log, now_unix_ms, Backoff, Handle, OwnerId, GRACE_CEILING_MS, MAX_QUEUE_SIZE,
    MAX_WORK_LEN, MIN_QUEUE_SIZE, WORK_PREVIEW_LEN,
};

/// Decides whether one owner may act on a worker launched by another.
pub trait RightsPolicy {
    fn allows(&self, caller: OwnerId, owner: OwnerId) -> bool;
}

/// Default policy: an owner may only touch its own workers.
pub struct OwnerEquality;

impl RightsPolicy for OwnerEquality {
    fn allows(&self, caller: OwnerId, owner: OwnerId) -> bool {
        caller == owner
    }
}

pub struct SessionOptions {
    pub owner_id: OwnerId,
    /// Explicit worker executable; `None` resolves via the environment.
    pub worker_bin: Option<PathBuf>,
    /// Opaque context snapshot copied into every segment for the worker
    /// to restore before it starts the work.
    pub context: Vec<u8>,
}

impl SessionOptions {
    pub fn new(owner_id: OwnerId) -> Self {
        SessionOptions {
            owner_id,
            worker_bin: None,
            context: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Spawned but not yet attached to the result queue.
    Starting,
    Running,
    Stopped,
    Unavailable,
}

/// Point-in-time view of one worker, as returned by [`Session::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub started_at_unix_ms: u64,
    /// When the launcher last drained a frame from this worker; zero
    /// before the first `result` call receives anything.
    pub last_msg_unix_ms: u64,
}

/// One registry entry as seen by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub pid: u32,
    pub cookie: u64,
    pub owner_id: OwnerId,
    pub state: WorkerState,
    pub queue_size: u32,
    pub consumed: bool,
    pub result_disabled: bool,
    pub canceled: bool,
    pub started_at_unix_ms: u64,
    pub rows_emitted: u64,
    pub last_activity_unix_ms: u64,
    pub last_error: Option<String>,
    pub work_preview: String,
}

enum DrainStep {
    Frame(Vec<u8>),
    SenderGone,
    Idle,
    Exited,
}

pub struct Session {
    owner_id: OwnerId,
    worker_bin: Option<PathBuf>,
    context: Vec<u8>,
    rights: Box<dyn RightsPolicy>,
    registry: Registry,
    interrupt: Arc<AtomicBool>,
    notifications: Vec<Notification>,
    notices: Vec<ErrorFields>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        Session {
            owner_id: options.owner_id,
            worker_bin: options.worker_bin,
            context: options.context,
            rights: Box::new(OwnerEquality),
            registry: Registry::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            notifications: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn with_rights(mut self, rights: Box<dyn RightsPolicy>) -> Self {
        self.rights = rights;
        self
    }

    /// Flag checked on every iteration of every blocking loop. Raise it
    /// from a signal handler or another thread to abort waits.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Launches a worker for `work` and registers it for a later
    /// `result` call.
    pub fn launch(&mut self, work: &[u8], queue_size: u32) -> Result<Handle> {
        self.launch_inner(work, queue_size, false)
    }

    /// Fire-and-forget launch: the worker runs the work and commits its
    /// side effects, but every result frame is dropped.
    pub fn submit(&mut self, work: &[u8], queue_size: u32) -> Result<Handle> {
        self.launch_inner(work, queue_size, true)
    }

    fn launch_inner(&mut self, work: &[u8], queue_size: u32, result_disabled: bool) -> Result<Handle> {
        if work.is_empty() {
            return Err(Error::InvalidParameter("work payload is empty".to_string()));
        }
        if work.len() > MAX_WORK_LEN {
            return Err(Error::LimitExceeded(format!(
                "work payload of {} bytes exceeds the {MAX_WORK_LEN} byte limit",
                work.len()
            )));
        }
        if queue_size < MIN_QUEUE_SIZE {
            return Err(Error::InvalidParameter(format!(
                "queue size {queue_size} is below the {MIN_QUEUE_SIZE} byte minimum"
            )));
        }
        if queue_size > MAX_QUEUE_SIZE {
            return Err(Error::LimitExceeded(format!(
                "queue size {queue_size} exceeds the {MAX_QUEUE_SIZE} byte limit"
            )));
        }

        let bin = resolve_worker_bin(self.worker_bin.as_deref())?;
        let cookie = fresh_cookie()?;
        let mut seg = Segment::create(
            self.owner_id,
            cookie,
            work,
            &self.context,
            queue_size as usize,
        )?;
        seg.queue()?.attach_receiver();

        let mut process = WorkerProcess::spawn(&bin, seg.name())?;
        let pid = process.pid();

        // Wait for the worker to attach before unlinking the name, so the
        // object cannot leak if we die first and cannot vanish before the
        // worker maps it.
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(50));
        loop {
            if self.interrupt.load(Ordering::Acquire) {
                process.signal_forceful();
                process.reap();
                seg.detach();
                return Err(Error::Interrupted);
            }
            if seg.queue()?.sender_attached() {
                break;
            }
            match process.status() {
                ProcessStatus::Running => backoff.sleep(),
                // Died before attaching; register anyway and let `result`
                // surface the lost connection.
                ProcessStatus::Stopped => break,
                ProcessStatus::Unavailable => {
                    seg.detach();
                    return Err(Error::ResourceExhausted(format!(
                        "worker pid {pid} became unqueryable during startup"
                    )));
                }
            }
        }
        seg.unlink();
        if result_disabled {
            seg.queue()?.detach_receiver();
        }
        seg.pin();

        let entry = WorkerEntry {
            handle: Handle { pid, cookie },
            owner_id: self.owner_id,
            seg: Some(seg),
            process,
            queue_size,
            consumed: false,
            result_disabled,
            canceled: false,
            started_at_unix_ms: now_unix_ms(),
            last_msg_unix_ms: 0,
            last_error: None,
            work_preview: preview(work),
        };
        self.registry.save(entry)?;
        Ok(Handle { pid, cookie })
    }

    /// Reads the worker's whole result stream. Single-read: success
    /// releases the entry outright, so a repeat call reports `NotFound`;
    /// a failed read leaves the entry behind, consumed, and a repeat
    /// call reports `AlreadyConsumed`.
    pub fn result(&mut self, handle: Handle, shape: ResultShape) -> Result<Vec<Row>> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.result_checked(handle.pid, shape)
    }

    /// `result` addressed by bare pid, for callers holding no cookie.
    pub fn result_by_pid(&mut self, pid: u32, shape: ResultShape) -> Result<Vec<Row>> {
        self.check_access(pid, None)?;
        self.result_checked(pid, shape)
    }

    fn result_checked(&mut self, pid: u32, shape: ResultShape) -> Result<Vec<Row>> {
        self.registry
            .with_entry_mut(pid, |e| {
                if e.result_disabled {
                    return Err(Error::ResultDisabled { pid });
                }
                if e.consumed {
                    return Err(Error::AlreadyConsumed { pid });
                }
                e.consumed = true;
                if let Some(seg) = e.seg.as_mut() {
                    seg.unpin();
                }
                Ok(())
            })
            .ok_or(Error::NotFound { pid })??;

        match self.drain(pid, shape) {
            Ok(rows) => {
                // Success releases everything; the detach hook has already
                // been disarmed by taking the segment out first.
                if let Some(entry) = self.registry.take(pid) {
                    self.registry.dispose(entry);
                }
                Ok(rows)
            }
            Err(err) => {
                // The entry stays registered so the failure shows up in
                // listings until the caller detaches it.
                self.registry.with_entry_mut(pid, |e| e.record_error(&err));
                Err(err)
            }
        }
    }

    fn drain(&mut self, pid: u32, shape: ResultShape) -> Result<Vec<Row>> {
        let mut decoder = ResultDecoder::new(shape);
        let mut rows = Vec::new();
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(50));
        let mut exited_once = false;

        while !decoder.is_complete() {
            if self.interrupt.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            let step = self
                .registry
                .with_entry_mut(pid, |e| -> Result<DrainStep> {
                    let status = {
                        let seg = e.seg.as_ref().ok_or(Error::ConnectionLost { pid })?;
                        seg.queue()?.try_recv()?
                    };
                    Ok(match status {
                        RecvStatus::Msg(frame) => {
                            e.last_msg_unix_ms = now_unix_ms();
                            DrainStep::Frame(frame)
                        }
                        RecvStatus::Detached => DrainStep::SenderGone,
                        RecvStatus::Empty => match e.process.status() {
                            ProcessStatus::Running => DrainStep::Idle,
                            _ => DrainStep::Exited,
                        },
                    })
                })
                .ok_or(Error::NotFound { pid })??;

            match step {
                DrainStep::Frame(frame) => {
                    backoff.reset();
                    exited_once = false;
                    match decoder.feed(&frame)? {
                        DecodeEvent::Row(row) => rows.push(row),
                        DecodeEvent::Notice(fields) => self.notices.push(fields),
                        DecodeEvent::Notify(n) => self.notifications.push(n),
                        DecodeEvent::RemoteError(fields) => {
                            return Err(Error::Remote(remote_error(pid, fields)));
                        }
                        DecodeEvent::Complete | DecodeEvent::None => {}
                    }
                }
                DrainStep::SenderGone => return Err(Error::ConnectionLost { pid }),
                DrainStep::Idle => backoff.sleep(),
                DrainStep::Exited => {
                    // One extra pass: the exit status can land before the
                    // final frames are read out of the queue.
                    if exited_once {
                        return Err(Error::ConnectionLost { pid });
                    }
                    exited_once = true;
                }
            }
        }

        rows.extend(decoder.finish()?);
        Ok(rows)
    }

    /// Forgets a worker without touching the process: the segment is
    /// released and the entry removed, the worker keeps running.
    pub fn detach(&mut self, handle: Handle) -> Result<()> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.detach_pid(handle.pid);
        Ok(())
    }

    pub fn detach_by_pid(&mut self, pid: u32) -> Result<()> {
        self.check_access(pid, None)?;
        self.detach_pid(pid);
        Ok(())
    }

    fn detach_pid(&mut self, pid: u32) {
        if let Some(mut entry) = self.registry.take(pid) {
            if let Some(mut seg) = entry.seg.take() {
                seg.unpin();
                seg.detach();
            }
        } else {
            debug_log(&format!("detach: pid {pid} already gone"));
        }
    }

    /// `cancel` with no grace: cooperative signal, immediate escalation.
    pub fn cancel(&mut self, handle: Handle) -> Result<()> {
        self.cancel_with_grace(handle, 0)
    }

    pub fn cancel_by_pid(&mut self, pid: u32) -> Result<()> {
        self.check_access(pid, None)?;
        self.cancel_checked(pid, 0)
    }

    /// Raises the shared cancel flag, signals the worker cooperatively,
    /// and escalates to a forceful stop if it is still running after
    /// `grace_ms`. Canceling an already stopped worker succeeds and does
    /// nothing; its pending results stay readable.
    pub fn cancel_with_grace(&mut self, handle: Handle, grace_ms: u64) -> Result<()> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.cancel_checked(handle.pid, grace_ms)
    }

    fn cancel_checked(&mut self, pid: u32, grace_ms: u64) -> Result<()> {
        let grace_ms = grace_ms.min(GRACE_CEILING_MS);
        let running = self
            .registry
            .with_entry_mut(pid, |e| {
                e.canceled = true;
                if let Some(seg) = e.seg.as_ref() {
                    if let Ok(ctl) = seg.control() {
                        ctl.request_cancel();
                    }
                }
                matches!(e.process.status(), ProcessStatus::Running)
            })
            .ok_or(Error::NotFound { pid })?;
        if !running {
            return Ok(());
        }

        self.registry
            .with_entry_mut(pid, |e| e.process.signal_cooperative());
        let deadline = Instant::now() + Duration::from_millis(grace_ms);
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(500));
        loop {
            if self.interrupt.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            let still_running = self
                .registry
                .with_entry_mut(pid, |e| matches!(e.process.status(), ProcessStatus::Running))
                .ok_or(Error::NotFound { pid })?;
            if !still_running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            backoff.sleep();
        }
        self.registry.with_entry_mut(pid, |e| {
            e.process.signal_forceful();
            e.process.reap();
        });
        Ok(())
    }

    /// Blocks until the worker process exits.
    pub fn wait(&mut self, handle: Handle) -> Result<()> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.wait_pid(handle.pid, None).map(|_| ())
    }

    pub fn wait_by_pid(&mut self, pid: u32) -> Result<()> {
        self.check_access(pid, None)?;
        self.wait_pid(pid, None).map(|_| ())
    }

    /// Like `wait`, but gives up after `timeout_ms`. Returns whether the
    /// worker exited within the timeout.
    pub fn wait_with_timeout(&mut self, handle: Handle, timeout_ms: u64) -> Result<bool> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.wait_pid(
            handle.pid,
            Some(Instant::now() + Duration::from_millis(timeout_ms)),
        )
    }

    fn wait_pid(&mut self, pid: u32, deadline: Option<Instant>) -> Result<bool> {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(100));
        loop {
            if self.interrupt.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            let status = self
                .registry
                .with_entry_mut(pid, |e| e.process.status())
                .ok_or(Error::NotFound { pid })?;
            if status != ProcessStatus::Running {
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            backoff.sleep();
        }
    }

    pub fn status(&mut self, handle: Handle) -> Result<WorkerStatus> {
        self.check_access(handle.pid, Some(handle.cookie))?;
        self.registry
            .with_entry_mut(handle.pid, |e| WorkerStatus {
                state: derive_state(e),
                started_at_unix_ms: e.started_at_unix_ms,
                last_msg_unix_ms: e.last_msg_unix_ms,
            })
            .ok_or(Error::NotFound { pid: handle.pid })
    }

    /// Snapshot of every entry visible to this session's owner. Entries
    /// that vanish between the pid snapshot and the per-entry read are
    /// skipped, not errors.
    pub fn list(&mut self) -> Vec<EntrySummary> {
        let mut out = Vec::new();
        for pid in self.registry.pids() {
            let summary = self.registry.with_entry_mut(pid, |e| {
                let (rows_emitted, last_activity) = match e.seg.as_ref().and_then(|s| s.control().ok())
                {
                    Some(ctl) => (ctl.rows_emitted(), ctl.last_activity_unix_ms()),
                    None => (0, 0),
                };
                EntrySummary {
                    pid,
                    cookie: e.handle.cookie,
                    owner_id: e.owner_id,
                    state: derive_state(e),
                    queue_size: e.queue_size,
                    consumed: e.consumed,
                    result_disabled: e.result_disabled,
                    canceled: e.canceled,
                    started_at_unix_ms: e.started_at_unix_ms,
                    rows_emitted,
                    last_activity_unix_ms: last_activity,
                    last_error: e.last_error.clone(),
                    work_preview: e.work_preview.clone(),
                }
            });
            match summary {
                Some(s) if self.rights.allows(self.owner_id, s.owner_id) => out.push(s),
                _ => {}
            }
        }
        out.sort_by_key(|s| (s.started_at_unix_ms, s.pid));
        out
    }

    /// Notifications relayed by workers since the last drain.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Non-error notices relayed by workers since the last drain.
    pub fn drain_notices(&mut self) -> Vec<ErrorFields> {
        std::mem::take(&mut self.notices)
    }

    fn check_access(&mut self, pid: u32, cookie: Option<u64>) -> Result<()> {
        let found = self
            .registry
            .with_entry_mut(pid, |e| (e.owner_id, e.handle.cookie))
            .ok_or(Error::NotFound { pid })?;
        if !self.rights.allows(self.owner_id, found.0) {
            return Err(Error::PermissionDenied { pid });
        }
        if let Some(cookie) = cookie {
            if cookie != found.1 {
                return Err(Error::StaleHandle { pid });
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Release every mapping; workers are left running on purpose.
        for pid in self.registry.pids() {
            if let Some(entry) = self.registry.take(pid) {
                self.registry.dispose(entry);
            }
        }
    }
}

fn derive_state(e: &mut WorkerEntry) -> WorkerState {
    match e.process.status() {
        ProcessStatus::Stopped => WorkerState::Stopped,
        ProcessStatus::Unavailable => WorkerState::Unavailable,
        ProcessStatus::Running => {
            let attached = e
                .seg
                .as_ref()
                .and_then(|s| s.queue().ok().map(|q| q.sender_attached()))
                .unwrap_or(true);
            if attached {
                WorkerState::Running
            } else {
                WorkerState::Starting
            }
        }
    }
}

fn preview(work: &[u8]) -> String {
    let text = String::from_utf8_lossy(work);
    text.chars().take(WORK_PREVIEW_LEN).collect()
}

fn fresh_cookie() -> Result<u64> {
    loop {
        let mut buf = [0u8; 8];
        getrandom::getrandom(&mut buf)
            .map_err(|e| Error::ResourceExhausted(format!("random cookie: {e}")))?;
        let cookie = u64::from_le_bytes(buf);
        if cookie != 0 {
            return Ok(cookie);
        }
    }
}
