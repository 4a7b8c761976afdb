//! Command-line front end: run a script in a background worker and print
//! its rows, or fire one off without consuming results.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bgq::{ColType, ResultShape, Session, SessionOptions, Value};

#[derive(Parser)]
#[command(name = "bgq", version, about = "Run work in a background worker over shared memory")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Launch a worker, wait for its results, and print them.
    Run {
        /// Script handed to the worker (';'-separated commands).
        script: String,
        /// Result queue size in bytes.
        #[arg(long, default_value_t = 65536)]
        queue_size: u32,
        /// Declared result shape, e.g. "int8,text".
        #[arg(long, default_value = "text")]
        shape: String,
        /// Worker executable; defaults to BGQ_WORKER_BIN or the bundled one.
        #[arg(long)]
        worker_bin: Option<PathBuf>,
        /// Print rows as JSON arrays instead of tab-separated text.
        #[arg(long)]
        json: bool,
    },
    /// Launch a worker fire-and-forget and wait for it to finish.
    Submit {
        script: String,
        #[arg(long, default_value_t = 65536)]
        queue_size: u32,
        #[arg(long)]
        worker_bin: Option<PathBuf>,
        /// Return immediately instead of waiting for the worker to exit.
        #[arg(long)]
        no_wait: bool,
    },
}

fn session(worker_bin: Option<PathBuf>) -> Session {
    let mut options = SessionOptions::new(std::process::id());
    options.worker_bin = worker_bin;
    Session::new(options)
}

fn parse_shape(raw: &str) -> Result<ResultShape> {
    let cols = raw
        .split(',')
        .map(|part| part.trim().parse::<ColType>())
        .collect::<bgq::Result<Vec<_>>>()
        .with_context(|| format!("bad shape {raw:?}"))?;
    Ok(ResultShape::new(cols))
}

fn value_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int4(n) => serde_json::Value::from(*n),
        Value::Int8(n) => serde_json::Value::from(*n),
        Value::Float8(x) => serde_json::Number::from_f64(*x)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(_) | Value::Bytea(_) => serde_json::Value::String(v.to_string()),
    }
}

fn run(script: &str, queue_size: u32, shape: &str, worker_bin: Option<PathBuf>, json: bool) -> Result<()> {
    let shape = parse_shape(shape)?;
    let mut s = session(worker_bin);
    let handle = s.launch(script.as_bytes(), queue_size)?;
    let rows = s.result(handle, shape)?;
    for row in &rows {
        if json {
            let fields: Vec<serde_json::Value> = row.iter().map(value_json).collect();
            println!("{}", serde_json::Value::Array(fields));
        } else {
            let fields: Vec<String> = row.iter().map(Value::to_string).collect();
            println!("{}", fields.join("\t"));
        }
    }
    for notice in s.drain_notices() {
        eprintln!("{}: {}", notice.severity, notice.message);
    }
    for n in s.drain_notifications() {
        eprintln!("notify {} from pid {}: {}", n.channel, n.pid, n.payload);
    }
    Ok(())
}

fn submit(script: &str, queue_size: u32, worker_bin: Option<PathBuf>, no_wait: bool) -> Result<()> {
    let mut s = session(worker_bin);
    let handle = s.submit(script.as_bytes(), queue_size)?;
    eprintln!("worker pid {} launched", handle.pid);
    if !no_wait {
        s.wait(handle)?;
    }
    s.detach(handle)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let outcome = match cli.cmd {
        Cmd::Run {
            script,
            queue_size,
            shape,
            worker_bin,
            json,
        } => run(&script, queue_size, &shape, worker_bin, json),
        Cmd::Submit {
            script,
            queue_size,
            worker_bin,
            no_wait,
        } => submit(&script, queue_size, worker_bin, no_wait),
    };
    if let Err(err) = outcome {
        eprintln!("bgq: {err:#}");
        std::process::exit(1);
    }
}
