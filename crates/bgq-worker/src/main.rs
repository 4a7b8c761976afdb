//! Worker executable running small ';'-separated scripts.
//!
//! Commands:
//!   rows N            emit N (n int8, label text) rows
//!   null-row          emit one all-null row
//!   tag TEXT          emit a command-completion tag
//!   sleep MS          sleep, checking for cancellation every slice
//!   sleep-hard MS     sleep without ever checking for cancellation
//!   fail MSG          fail the work with MSG
//!   notice MSG        emit a non-error notice
//!   notify CHAN MSG   emit an asynchronous notification
//!   touch PATH        create an empty file (an observable side effect)

use std::time::Duration;

use anyhow::{Context, Result};

use bgq::worker::{run_worker, CancelToken, ResultSink, WorkExecutor};
use bgq::{ColType, Error, RemoteError, Value};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct ScriptExecutor {
    described: bool,
}

impl ScriptExecutor {
    fn describe_once(&mut self, sink: &mut dyn ResultSink) -> bgq::Result<()> {
        if !self.described {
            sink.row_description(&[("n", ColType::Int8), ("label", ColType::Text)])?;
            self.described = true;
        }
        Ok(())
    }
}

fn script_error(code: &str, message: String) -> Error {
    Error::Remote(RemoteError {
        pid: std::process::id(),
        severity: "ERROR".to_string(),
        code: code.to_string(),
        message,
        detail: None,
        hint: None,
    })
}

fn canceled() -> Error {
    script_error("canceled", "canceling work due to cancel request".to_string())
}

impl WorkExecutor for ScriptExecutor {
    fn execute(
        &mut self,
        work: &[u8],
        cancel: &CancelToken<'_>,
        sink: &mut dyn ResultSink,
    ) -> bgq::Result<()> {
        let script = std::str::from_utf8(work)
            .map_err(|_| script_error("encoding", "work payload is not UTF-8".to_string()))?;
        for raw in script.split(';') {
            let cmd = raw.trim();
            if cmd.is_empty() {
                continue;
            }
            if cancel.is_canceled() {
                return Err(canceled());
            }
            let (verb, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
            let rest = rest.trim();
            match verb {
                "rows" => {
                    let n: u64 = rest
                        .parse()
                        .map_err(|_| script_error("parse", format!("bad row count {rest:?}")))?;
                    self.describe_once(sink)?;
                    for i in 0..n {
                        if cancel.is_canceled() {
                            return Err(canceled());
                        }
                        sink.data_row(&[
                            Value::Int8(i as i64),
                            Value::Text(format!("row-{i}")),
                        ])?;
                    }
                }
                "null-row" => {
                    self.describe_once(sink)?;
                    sink.data_row(&[Value::Null, Value::Null])?;
                }
                "tag" => sink.command_complete(rest)?,
                "sleep" => {
                    let ms: u64 = rest
                        .parse()
                        .map_err(|_| script_error("parse", format!("bad sleep {rest:?}")))?;
                    let deadline =
                        std::time::Instant::now() + Duration::from_millis(ms);
                    while std::time::Instant::now() < deadline {
                        if cancel.is_canceled() {
                            return Err(canceled());
                        }
                        std::thread::sleep(SLEEP_SLICE);
                    }
                }
                "sleep-hard" => {
                    let ms: u64 = rest
                        .parse()
                        .map_err(|_| script_error("parse", format!("bad sleep {rest:?}")))?;
                    std::thread::sleep(Duration::from_millis(ms));
                }
                "fail" => return Err(script_error("script", rest.to_string())),
                "notice" => sink.notice("NOTICE", rest)?,
                "notify" => {
                    let (channel, payload) = rest.split_once(' ').unwrap_or((rest, ""));
                    sink.notify(channel, payload.trim())?;
                }
                "touch" => {
                    std::fs::File::create(rest).map_err(|e| {
                        script_error("io", format!("could not create {rest:?}: {e}"))
                    })?;
                }
                other => {
                    return Err(script_error(
                        "parse",
                        format!("unknown command {other:?}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let segment = std::env::args()
        .nth(1)
        .context("usage: bgq-worker <segment-name>")?;
    run_worker(&segment, &mut ScriptExecutor::default())?;
    Ok(())
}
