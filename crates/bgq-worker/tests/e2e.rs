//! End-to-end tests driving the real worker executable through a session.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bgq::{ColType, Error, ResultShape, Session, SessionOptions, Value, WorkerState};

fn session() -> Session {
    let mut options = SessionOptions::new(7);
    options.worker_bin = Some(PathBuf::from(env!("CARGO_BIN_EXE_bgq-worker")));
    Session::new(options)
}

fn two_col_shape() -> ResultShape {
    ResultShape::new(vec![ColType::Int8, ColType::Text])
}

fn tmp(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bgq-e2e-{}-{name}", std::process::id()))
}

fn wait_for_file(path: &PathBuf) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn three_rows_in_order_then_entry_is_gone() {
    let mut s = session();
    let h = s.launch(b"rows 3", 65536).unwrap();
    let rows = s.result(h, two_col_shape()).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Int8(0), Value::Text("row-0".to_string())],
            vec![Value::Int8(1), Value::Text("row-1".to_string())],
            vec![Value::Int8(2), Value::Text("row-2".to_string())],
        ]
    );
    // Success released the entry; the handle no longer resolves.
    assert!(matches!(
        s.result(h, two_col_shape()),
        Err(Error::NotFound { .. })
    ));
    assert!(s.list().is_empty());
}

#[test]
fn each_command_tag_becomes_a_text_row() {
    let mut s = session();
    let h = s.launch(b"tag DONE 3; tag COPY 1", 65536).unwrap();
    let rows = s.result(h, ResultShape::single_text()).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Text("DONE 3".to_string())],
            vec![Value::Text("COPY 1".to_string())],
        ]
    );
}

#[test]
fn shape_mismatch_keeps_the_entry_consumed() {
    let mut s = session();
    let h = s.launch(b"rows 1", 65536).unwrap();
    assert!(matches!(
        s.result(h, ResultShape::single_text()),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        s.result(h, ResultShape::single_text()),
        Err(Error::AlreadyConsumed { .. })
    ));
    let listed = s.list();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].consumed);
    assert!(listed[0].last_error.as_ref().unwrap().contains("shape"));
    s.detach(h).unwrap();
}

#[test]
fn worker_failure_surfaces_as_remote_error() {
    let mut s = session();
    let h = s.launch(b"fail boom", 65536).unwrap();
    match s.result(h, ResultShape::single_text()) {
        Err(Error::Remote(re)) => {
            assert_eq!(re.severity, "ERROR");
            assert_eq!(re.pid, h.pid);
            assert_eq!(re.message, "boom");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let listed = s.list();
    assert!(listed[0].last_error.as_ref().unwrap().contains("boom"));
    s.detach(h).unwrap();
}

#[test]
fn null_fields_decode_as_null_values() {
    let mut s = session();
    let h = s.launch(b"null-row", 65536).unwrap();
    let rows = s.result(h, two_col_shape()).unwrap();
    assert_eq!(rows, vec![vec![Value::Null, Value::Null]]);
}

#[test]
fn notices_and_notifications_are_relayed() {
    let mut s = session();
    let h = s.launch(b"notice hello; notify jobs done; rows 1", 65536).unwrap();
    let rows = s.result(h, two_col_shape()).unwrap();
    assert_eq!(rows.len(), 1);
    let notices = s.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].message, "hello");
    let notifications = s.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].channel, "jobs");
    assert_eq!(notifications[0].payload, "done");
    assert_eq!(notifications[0].pid, h.pid);
    assert!(s.drain_notices().is_empty());
}

#[test]
fn many_rows_flow_through_a_small_queue() {
    // The ring is far smaller than the result stream, so the worker must
    // block on a full queue and resume as the launcher drains it.
    let mut s = session();
    let h = s.launch(b"rows 500", 1024).unwrap();
    let rows = s.result(h, two_col_shape()).unwrap();
    assert_eq!(rows.len(), 500);
    assert_eq!(rows[499][1], Value::Text("row-499".to_string()));
}

#[test]
fn cancel_stops_a_sleeping_worker_within_grace() {
    let mut s = session();
    let h = s.launch(b"sleep 60000", 65536).unwrap();
    s.cancel_with_grace(h, 5000).unwrap();
    assert_eq!(s.status(h).unwrap().state, WorkerState::Stopped);
    match s.result(h, ResultShape::single_text()) {
        Err(Error::Remote(re)) => assert!(re.message.contains("cancel")),
        other => panic!("unexpected outcome {other:?}"),
    }
    s.detach(h).unwrap();
}

#[test]
fn cancel_escalates_when_cooperation_is_ignored() {
    // The worker never checks its cancel flag, so the cooperative signal
    // does nothing and the forceful stop has to land after the grace.
    let mut s = session();
    let h = s.launch(b"sleep-hard 60000", 65536).unwrap();
    let start = Instant::now();
    s.cancel_with_grace(h, 200).unwrap();
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(s.status(h).unwrap().state, WorkerState::Stopped);
    // A killed worker never sent its terminal marker.
    assert!(matches!(
        s.result(h, ResultShape::single_text()),
        Err(Error::ConnectionLost { .. })
    ));
    s.detach(h).unwrap();
}

#[test]
fn cancel_prevents_commands_after_the_interrupted_one() {
    let path = tmp("cancel-prevents");
    let _ = std::fs::remove_file(&path);
    let mut s = session();
    let script = format!("sleep 60000; touch {}", path.display());
    let h = s.launch(script.as_bytes(), 65536).unwrap();
    s.cancel_with_grace(h, 5000).unwrap();
    s.wait(h).unwrap();
    assert!(!path.exists());
    s.detach(h).unwrap();
}

#[test]
fn cancel_of_a_finished_worker_keeps_results_readable() {
    let mut s = session();
    let h = s.launch(b"tag OK", 65536).unwrap();
    s.wait(h).unwrap();
    s.cancel_with_grace(h, 0).unwrap();
    let rows = s.result(h, ResultShape::single_text()).unwrap();
    assert_eq!(rows, vec![vec![Value::Text("OK".to_string())]]);
}

#[test]
fn detached_worker_still_commits_its_side_effects() {
    let path = tmp("detach-commit");
    let _ = std::fs::remove_file(&path);
    let mut s = session();
    let script = format!("sleep 200; touch {}", path.display());
    let h = s.launch(script.as_bytes(), 65536).unwrap();
    s.detach(h).unwrap();
    assert!(s.list().is_empty());
    assert!(wait_for_file(&path));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn submit_runs_the_work_but_disables_results() {
    let path = tmp("submit-commit");
    let _ = std::fs::remove_file(&path);
    let mut s = session();
    let script = format!("touch {}", path.display());
    let h = s.submit(script.as_bytes(), 65536).unwrap();
    assert!(matches!(
        s.result(h, ResultShape::single_text()),
        Err(Error::ResultDisabled { .. })
    ));
    assert!(wait_for_file(&path));
    s.detach(h).unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn wait_with_timeout_distinguishes_slow_and_done() {
    let mut s = session();
    let h = s.launch(b"sleep 60000", 65536).unwrap();
    assert!(!s.wait_with_timeout(h, 50).unwrap());
    s.cancel_with_grace(h, 5000).unwrap();
    assert!(s.wait_with_timeout(h, 5000).unwrap());
    s.detach(h).unwrap();
}

#[test]
fn listing_shows_live_workers_and_their_previews() {
    let mut s = session();
    let a = s.launch(b"sleep 60000", 65536).unwrap();
    let b = s.launch(b"sleep 60000; tag X", 65536).unwrap();
    let listed = s.list();
    assert_eq!(listed.len(), 2);
    let cookie_of = |pid: u32| listed.iter().find(|e| e.pid == pid).unwrap().cookie;
    assert_eq!(cookie_of(a.pid), a.cookie);
    assert_eq!(cookie_of(b.pid), b.cookie);
    for entry in &listed {
        assert!(entry.work_preview.starts_with("sleep 60000"));
        assert!(matches!(
            entry.state,
            WorkerState::Starting | WorkerState::Running
        ));
    }
    s.cancel_with_grace(a, 5000).unwrap();
    s.cancel_with_grace(b, 5000).unwrap();
}

#[test]
fn stale_cookie_never_reaches_another_workers_data() {
    let mut s = session();
    let h = s.launch(b"rows 1", 65536).unwrap();
    let forged = bgq::Handle {
        pid: h.pid,
        cookie: h.cookie.wrapping_add(1),
    };
    assert!(matches!(
        s.result(forged, two_col_shape()),
        Err(Error::StaleHandle { .. })
    ));
    // The real handle is untouched by the failed attempt.
    assert_eq!(s.result(h, two_col_shape()).unwrap().len(), 1);
}
