//! Child-side task executor.
//!
//! A worker process runs one synchronous loop: read a sentinel-framed
//! request from stdin, run the named task, write the framed response to
//! stdout. Parallelism comes from the pool running many workers, not
//! from threads inside one worker. Task failures, including panics,
//! become failure responses; only an undecodable frame or a broken pipe
//! stops the loop, because without an id there is nothing to respond to.

use crate::codec::{self, Frame, TaskKind, TaskRequest, TaskResponse, SENTINEL};
use commons::prelude_errors::*;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

/// A registered function task.
pub type TaskFn = fn(&[Value]) -> Fallible<Value>;

/// A class-kind task instance: constructed with the request arguments,
/// then run once.
pub trait Job: Send {
    /// Execute the job and produce its result.
    fn run(&mut self) -> Fallible<Value>;
}

/// A registered class-kind constructor.
pub type JobFactory = fn(&[Value]) -> Fallible<Box<dyn Job>>;

/// Name → task tables for one worker.
#[derive(Default)]
pub struct Registry {
    funcs: HashMap<String, TaskFn>,
    factories: HashMap<String, JobFactory>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registry preloaded with the built-in task set.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::new();
        registry.register_func("echo", builtin::echo);
        registry.register_func("double", builtin::double);
        registry.register_func("sum", builtin::sum);
        registry.register_func("range", builtin::range);
        registry.register_func("sleep_ms", builtin::sleep_ms);
        registry.register_func("pid", builtin::pid);
        registry.register_func("fail", builtin::fail);
        registry.register_func("die", builtin::die);
        registry.register_factory("repeat", builtin::repeat);
        registry
    }

    /// Register a function task under `name`.
    pub fn register_func<S: Into<String>>(&mut self, name: S, task: TaskFn) {
        self.funcs.insert(name.into(), task);
    }

    /// Register a class-kind constructor under `name`.
    pub fn register_factory<S: Into<String>>(&mut self, name: S, factory: JobFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Run one request to a response; task errors never propagate.
    pub fn dispatch(&self, request: &TaskRequest) -> TaskResponse {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(request)));
        match outcome {
            Ok(Ok(value)) => TaskResponse::ok(value),
            Ok(Err(err)) => TaskResponse::fail(format!("{:#}", err)),
            Err(panic) => {
                TaskResponse::fail(format!("task panicked: {}", panic_text(&panic)))
            }
        }
    }

    fn run(&self, request: &TaskRequest) -> Fallible<Value> {
        match request.kind {
            TaskKind::Func => {
                let task = self
                    .funcs
                    .get(&request.name)
                    .ok_or_else(|| format_err!("no task registered as '{}'", request.name))?;
                task(&request.args)
            }
            TaskKind::Class => {
                let factory = self
                    .factories
                    .get(&request.name)
                    .ok_or_else(|| format_err!("no class registered as '{}'", request.name))?;
                let mut job = factory(&request.args)
                    .with_context(|| format!("constructing '{}'", request.name))?;
                job.run()
            }
        }
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Serve framed requests from `reader` until EOF.
pub fn run_loop<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    registry: &Registry,
) -> Fallible<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(SENTINEL, &mut buf)?;
        if n == 0 {
            debug!("stdin closed, worker exiting");
            return Ok(());
        }
        let frame = codec::decode(&buf).context("undecodable request frame")?;
        let response = match serde_json::from_value::<TaskRequest>(frame.payload) {
            Ok(request) => {
                trace!("request {}: {:?} '{}'", frame.id, request.kind, request.name);
                registry.dispatch(&request)
            }
            Err(err) => TaskResponse::fail(format!("malformed request: {}", err)),
        };
        let reply = Frame {
            id: frame.id,
            payload: serde_json::to_value(response)?,
        };
        writer.write_all(&codec::encode(&reply)?)?;
        writer.flush()?;
    }
}

/// Built-in task set shipped with the stock worker binary.
pub mod builtin {
    use super::Job;
    use commons::prelude_errors::*;
    use serde_json::{json, Value};
    use std::thread;
    use std::time::Duration;

    fn number(args: &[Value], index: usize) -> Fallible<i64> {
        args.get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| format_err!("argument {} must be an integer", index))
    }

    /// Return the arguments unchanged.
    pub fn echo(args: &[Value]) -> Fallible<Value> {
        Ok(Value::Array(args.to_vec()))
    }

    /// Double one integer argument.
    pub fn double(args: &[Value]) -> Fallible<Value> {
        Ok(json!(number(args, 0)? * 2))
    }

    /// Sum any count of integer arguments.
    pub fn sum(args: &[Value]) -> Fallible<Value> {
        let mut total = 0i64;
        for index in 0..args.len() {
            total += number(args, index)?;
        }
        Ok(json!(total))
    }

    /// Integers `0..n` as an array; `map` callers see it flattened.
    pub fn range(args: &[Value]) -> Fallible<Value> {
        let n = number(args, 0)?;
        ensure!(n >= 0, "range bound must be non-negative");
        Ok(json!((0..n).collect::<Vec<i64>>()))
    }

    /// Sleep for the given number of milliseconds, then return it.
    pub fn sleep_ms(args: &[Value]) -> Fallible<Value> {
        let ms = number(args, 0)?;
        ensure!(ms >= 0, "sleep duration must be non-negative");
        thread::sleep(Duration::from_millis(ms as u64));
        Ok(json!(ms))
    }

    /// This worker's process id; lets callers observe worker recycling.
    pub fn pid(_args: &[Value]) -> Fallible<Value> {
        Ok(json!(std::process::id()))
    }

    /// Fail with the given diagnostic (or a stock one).
    pub fn fail(args: &[Value]) -> Fallible<Value> {
        let diagnostic = args
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or("task failed by request");
        bail!("{}", diagnostic);
    }

    /// Exit the worker process without responding. Exists to exercise the
    /// parent's worker-death handling; never dispatch it in-process.
    pub fn die(_args: &[Value]) -> Fallible<Value> {
        std::process::exit(0);
    }

    struct Repeat {
        value: Value,
        times: usize,
    }

    impl Job for Repeat {
        fn run(&mut self) -> Fallible<Value> {
            Ok(Value::Array(vec![self.value.clone(); self.times]))
        }
    }

    /// Class-kind constructor: repeat `args[0]`, `args[1]` times.
    pub fn repeat(args: &[Value]) -> Fallible<Box<dyn Job>> {
        let value = args
            .get(0)
            .cloned()
            .ok_or_else(|| format_err!("missing value to repeat"))?;
        let times = number(args, 1)?;
        ensure!(times >= 0, "repeat count must be non-negative");
        Ok(Box::new(Repeat {
            value,
            times: times as usize,
        }))
    }
}
