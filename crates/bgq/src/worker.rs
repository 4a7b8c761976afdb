//! Worker-side entry point.
//!
//! A worker executable parses the segment name off its command line,
//! implements [`WorkExecutor`] for its kind of work, and calls
//! [`run_worker`]. Everything else, attaching, the result protocol, the
//! terminal marker, and error reporting, is handled here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::control::ControlBlock;
use crate::error::{Error, Result};
use crate::queue::SendStatus;
use crate::result::{ColType, Value};
use crate::segment::Segment;
use crate::wire::{self, ColumnDesc, ErrorFields, Message, Notification};
use crate::{now_unix_ms, Backoff};

static TERM: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_term(_sig: libc::c_int) {
    TERM.store(true, Ordering::Release);
}

/// Installs the cooperative-stop handler. Safe to call more than once.
pub fn install_term_handler() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
    }
}

fn term_requested() -> bool {
    TERM.load(Ordering::Acquire)
}

/// Checked by executors at their cancellation points. Raised either by
/// the launcher through the shared control block or by a cooperative
/// stop signal.
pub struct CancelToken<'a> {
    control: &'a ControlBlock,
}

impl CancelToken<'_> {
    pub fn is_canceled(&self) -> bool {
        self.control.cancel_requested() || term_requested()
    }
}

/// Where an executor writes its results. One row description, then rows,
/// then optionally a command tag; notices and notifications may be
/// interleaved anywhere.
pub trait ResultSink {
    fn row_description(&mut self, cols: &[(&str, ColType)]) -> Result<()>;
    fn data_row(&mut self, row: &[Value]) -> Result<()>;
    fn command_complete(&mut self, tag: &str) -> Result<()>;
    fn notice(&mut self, severity: &str, message: &str) -> Result<()>;
    fn notify(&mut self, channel: &str, payload: &str) -> Result<()>;
}

/// The work a particular worker binary knows how to run.
pub trait WorkExecutor {
    /// Restores launcher state from the opaque context snapshot before
    /// any work runs.
    fn restore_context(&mut self, _context: &[u8]) -> Result<()> {
        Ok(())
    }

    fn execute(
        &mut self,
        work: &[u8],
        cancel: &CancelToken<'_>,
        sink: &mut dyn ResultSink,
    ) -> Result<()>;
}

/// Sink writing frames onto the segment's queue. Once the receiver is
/// observed detached, every later write is discarded: the work still
/// runs to completion, its results just have no audience.
struct QueueSink<'a> {
    seg: &'a Segment,
    pid: u32,
    dropped: bool,
}

impl<'a> QueueSink<'a> {
    fn new(seg: &'a Segment) -> Self {
        QueueSink {
            seg,
            pid: std::process::id(),
            dropped: false,
        }
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        if self.dropped {
            return Ok(());
        }
        let frame = wire::encode(msg);
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(100));
        loop {
            match self.seg.queue()?.try_send(&frame)? {
                SendStatus::Sent => {
                    self.seg.control()?.touch(now_unix_ms());
                    return Ok(());
                }
                SendStatus::Detached => {
                    self.dropped = true;
                    return Ok(());
                }
                SendStatus::Full => {
                    // A canceled worker must not block forever on a
                    // receiver that stopped draining.
                    if term_requested() || self.seg.control()?.cancel_requested() {
                        self.dropped = true;
                        return Ok(());
                    }
                    backoff.sleep();
                }
            }
        }
    }
}

impl ResultSink for QueueSink<'_> {
    fn row_description(&mut self, cols: &[(&str, ColType)]) -> Result<()> {
        let cols = cols
            .iter()
            .map(|(name, ty)| ColumnDesc {
                name: (*name).to_string(),
                type_code: ty.type_code(),
            })
            .collect();
        self.send(&Message::RowDescription(cols))
    }

    fn data_row(&mut self, row: &[Value]) -> Result<()> {
        let fields = row.iter().map(field_bytes).collect();
        self.send(&Message::DataRow(fields))?;
        self.seg.control()?.note_row_emitted();
        Ok(())
    }

    fn command_complete(&mut self, tag: &str) -> Result<()> {
        self.send(&Message::CommandComplete(tag.to_string()))
    }

    fn notice(&mut self, severity: &str, message: &str) -> Result<()> {
        self.send(&Message::NoticeResponse(ErrorFields {
            severity: severity.to_string(),
            code: "notice".to_string(),
            message: message.to_string(),
            detail: None,
            hint: None,
        }))
    }

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.send(&Message::Notify(Notification {
            pid: self.pid,
            channel: channel.to_string(),
            payload: payload.to_string(),
        }))
    }
}

fn field_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(vec![u8::from(*b)]),
        Value::Int4(n) => Some(n.to_le_bytes().to_vec()),
        Value::Int8(n) => Some(n.to_le_bytes().to_vec()),
        Value::Float8(x) => Some(x.to_le_bytes().to_vec()),
        Value::Text(s) => Some(s.as_bytes().to_vec()),
        Value::Bytea(b) => Some(b.clone()),
    }
}

fn error_fields(err: &Error) -> ErrorFields {
    match err {
        Error::Remote(re) => ErrorFields {
            severity: re.severity.clone(),
            code: re.code.clone(),
            message: re.message.clone(),
            detail: re.detail.clone(),
            hint: re.hint.clone(),
        },
        other => ErrorFields {
            severity: "ERROR".to_string(),
            code: "internal".to_string(),
            message: other.to_string(),
            detail: None,
            hint: None,
        },
    }
}

/// Attaches to the named segment and runs `executor` over its work
/// payload. A clean run ends with the terminal ready marker; a failed
/// run ends with an error frame and no marker.
pub fn run_worker(segment_name: &str, executor: &mut dyn WorkExecutor) -> Result<()> {
    install_term_handler();
    let seg = Segment::attach(segment_name)?;
    seg.queue()?.attach_sender();
    seg.control()?.touch(now_unix_ms());

    let mut sink = QueueSink::new(&seg);
    let outcome = run_work(&seg, executor, &mut sink);
    match outcome {
        Ok(()) => sink.send(&Message::Ready)?,
        Err(err) => sink.send(&Message::ErrorResponse(error_fields(&err)))?,
    }
    seg.queue()?.detach_sender();
    Ok(())
}

fn run_work(
    seg: &Segment,
    executor: &mut dyn WorkExecutor,
    sink: &mut QueueSink<'_>,
) -> Result<()> {
    executor.restore_context(seg.context()?)?;
    let cancel = CancelToken {
        control: seg.control()?,
    };
    // Cancel raised before any work starts: finish cleanly with nothing
    // done, exactly as if the work were empty.
    if cancel.is_canceled() {
        return Ok(());
    }
    executor.execute(seg.work()?, &cancel, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{DecodeEvent, ResultDecoder, ResultShape};
    use crate::queue::RecvStatus;

    struct Echo;

    impl WorkExecutor for Echo {
        fn execute(
            &mut self,
            work: &[u8],
            _cancel: &CancelToken<'_>,
            sink: &mut dyn ResultSink,
        ) -> Result<()> {
            sink.row_description(&[("echo", ColType::Text)])?;
            sink.data_row(&[Value::Text(String::from_utf8_lossy(work).into_owned())])?;
            Ok(())
        }
    }

    struct Failing;

    impl WorkExecutor for Failing {
        fn execute(
            &mut self,
            _work: &[u8],
            _cancel: &CancelToken<'_>,
            _sink: &mut dyn ResultSink,
        ) -> Result<()> {
            Err(Error::InvalidParameter("bad work".to_string()))
        }
    }

    fn drain_events(seg: &Segment, shape: ResultShape) -> Vec<DecodeEvent> {
        let mut decoder = ResultDecoder::new(shape);
        let mut events = Vec::new();
        loop {
            match seg.queue().unwrap().try_recv().unwrap() {
                RecvStatus::Msg(frame) => {
                    let ev = decoder.feed(&frame).unwrap();
                    let done = ev == DecodeEvent::Complete;
                    events.push(ev);
                    if done {
                        break;
                    }
                }
                RecvStatus::Detached | RecvStatus::Empty => break,
            }
        }
        events
    }

    #[test]
    fn echo_worker_streams_one_row_then_ready() {
        let seg = Segment::create(1, 2, b"hello", b"", 4096).unwrap();
        run_worker(seg.name(), &mut Echo).unwrap();
        let events = drain_events(&seg, ResultShape::single_text());
        assert_eq!(
            events,
            vec![
                DecodeEvent::None,
                DecodeEvent::Row(vec![Value::Text("hello".to_string())]),
                DecodeEvent::Complete,
            ]
        );
        assert_eq!(seg.control().unwrap().rows_emitted(), 1);
    }

    #[test]
    fn failing_worker_sends_error_and_no_ready() {
        let seg = Segment::create(1, 2, b"w", b"", 4096).unwrap();
        run_worker(seg.name(), &mut Failing).unwrap();
        let mut decoder = ResultDecoder::new(ResultShape::single_text());
        let frame = match seg.queue().unwrap().try_recv().unwrap() {
            RecvStatus::Msg(f) => f,
            other => panic!("expected a frame, got {other:?}"),
        };
        match decoder.feed(&frame).unwrap() {
            DecodeEvent::RemoteError(fields) => {
                assert_eq!(fields.severity, "ERROR");
                assert!(fields.message.contains("bad work"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Sender detached without the ready marker.
        assert_eq!(
            seg.queue().unwrap().try_recv().unwrap(),
            RecvStatus::Detached
        );
    }

    #[test]
    fn pre_raised_cancel_skips_the_work() {
        let seg = Segment::create(1, 2, b"w", b"", 4096).unwrap();
        seg.control().unwrap().request_cancel();
        // A failing executor proves execute() never ran.
        run_worker(seg.name(), &mut Failing).unwrap();
        let events = drain_events(&seg, ResultShape::single_text());
        assert_eq!(events, vec![DecodeEvent::Complete]);
    }

    #[test]
    fn detached_receiver_discards_output_without_failing() {
        let seg = Segment::create(1, 2, b"hello", b"", 4096).unwrap();
        seg.queue().unwrap().detach_receiver();
        run_worker(seg.name(), &mut Echo).unwrap();
        assert_eq!(seg.control().unwrap().rows_emitted(), 1);
    }
}
