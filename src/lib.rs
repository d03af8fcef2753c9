//! Rust bindings for libjq, the library behind the `jq` JSON processor.
//!
//! This crate loads libjq at runtime and wraps it in safe types. Errors that
//! libjq reports through its error callback are routed back into Rust
//! closures by the trampoline in [`callback`].
//!
//! # Example
//!
//! ```no_run
//! use jqffi::Jq;
//! use serde_json::json;
//!
//! let jq = Jq::new().unwrap();
//! jq.compile(".[] | .name", &json!([])).unwrap();
//! let names = jq.execute(&json!([{"name": "Alice"}, {"name": "Bob"}])).unwrap();
//! assert_eq!(names, vec![json!("Alice"), json!("Bob")]);
//! ```

pub mod callback;
mod error;
pub mod ffi;
pub mod jv;
mod setup;

pub use callback::{CallbackId, ErrorCallbackSlot, ErrorDispatch, Registry};
pub use error::{JqError, Result};
pub use jv::{Jv, JvKind, PrintFlags};
pub use setup::{library_candidates, library_dirs, LIB_DIR_ENV};

use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::Value;

use ffi::jq_state;

/// Stack size for the FFI worker thread (8 MB).
/// libjq's parser and block compiler recurse on deeply nested programs.
const FFI_THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Commands sent to the FFI worker thread.
enum FfiCommand {
    Compile {
        program: String,
        args: Value,
        reply: Sender<Result<()>>,
    },
    Execute {
        input: Value,
        reply: Sender<Result<Vec<Value>>>,
    },
    ExecuteJson {
        input: String,
        reply: Sender<Result<Vec<String>>>,
    },
    SetErrorHandler {
        id: Option<CallbackId>,
        reply: Sender<()>,
    },
    Start {
        program: String,
        args: Value,
        inputs: Receiver<Value>,
        outputs: Sender<Value>,
        errors: Sender<JqError>,
        reply: Sender<CallbackId>,
    },
    Shutdown,
}

/// Internal state held by the FFI worker thread.
struct FfiWorkerState {
    lib: &'static ffi::JqLib,
    state: *mut jq_state,
    handler: Option<CallbackId>,
    compiled: bool,
}

impl FfiWorkerState {
    fn cstring(s: &str) -> Result<CString> {
        CString::new(s).map_err(|e| JqError::OperationFailed(e.to_string()))
    }

    /// Reinstalls the user's handler, or the built-in one if there is none.
    fn restore_error_cb(&self) {
        unsafe {
            match self.handler {
                Some(id) => callback::install::<Registry, _>(self.lib, self.state, id),
                None => callback::reset_to_default(self.lib, self.state),
            }
        }
    }

    fn handle_compile(&mut self, program: &str, args: &Value) -> Result<()> {
        let c_program = Self::cstring(program)?;
        let args = Jv::from_value(self.lib, args)?;

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&diagnostics);
        let forward = self.handler;
        let registry = Registry::global();
        let collector = registry.register(move |err: Jv| {
            let msg = err
                .clone()
                .format_error()
                .unwrap_or_else(|| "unknown compile error".to_string());
            if let Ok(mut errors) = sink.lock() {
                errors.push(msg);
            }
            if let Some(id) = forward {
                Registry::global().invoke(id, err);
            }
        });

        // jq_compile_args consumes args
        let ok = unsafe {
            callback::install::<Registry, _>(self.lib, self.state, collector);
            let ok = (self.lib.jq_compile_args)(self.state, c_program.as_ptr(), args.into_raw());
            ok != 0
        };
        self.restore_error_cb();
        registry.unregister(collector);

        let errors = diagnostics
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default();
        self.compiled = ok && errors.is_empty();

        if !errors.is_empty() {
            return Err(JqError::CompileFailed(errors));
        }
        if !ok {
            return Err(JqError::CompileFailed(vec![
                "jq_compile returned error, but no errors were reported".to_string(),
            ]));
        }
        log::debug!("compiled jq program {:?}", program);
        Ok(())
    }

    /// Runs the compiled program against `input`, consuming it.
    ///
    /// Returns the outputs produced and, if the program stopped on an
    /// uncaught error, that error's message. The outputs before the error
    /// are kept.
    fn run(&self, input: Jv) -> Result<(Vec<Jv>, Option<String>)> {
        if !self.compiled {
            return Err(JqError::NotCompiled);
        }

        let lib = self.lib;
        let mut results = Vec::new();
        unsafe {
            (lib.jq_start)(self.state, input.into_raw(), 0);
            loop {
                let next = Jv::from_raw(lib, (lib.jq_next)(self.state));
                if !next.is_valid() {
                    let failure = next.clone().invalid_message();
                    if failure.is_some() {
                        self.forward_to_handler(next);
                    }
                    return Ok((results, failure));
                }
                results.push(next);
            }
        }
    }

    /// Hands an uncaught runtime error to the user's handler, if any.
    fn forward_to_handler(&self, error: Jv) {
        if let Some(id) = self.handler {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                Registry::global().invoke(id, error);
            }));
            if delivered.is_err() {
                log::error!("panic in jq error handler {}", id);
            }
        }
    }

    fn handle_execute(&self, input: &Value) -> Result<Vec<Value>> {
        let input = Jv::from_value(self.lib, input)?;
        let (results, failure) = self.run(input)?;
        let outputs = results.iter().map(Jv::to_value).collect::<Result<Vec<_>>>()?;
        match failure {
            Some(message) => Err(JqError::ExecutionFailed { message, outputs }),
            None => Ok(outputs),
        }
    }

    fn handle_execute_json(&self, input: &str) -> Result<Vec<String>> {
        let input = Jv::parse(self.lib, input)?;
        let (results, failure) = self.run(input)?;
        match failure {
            Some(message) => Err(JqError::ExecutionFailed {
                message,
                outputs: results.iter().map(Jv::to_value).collect::<Result<Vec<_>>>()?,
            }),
            None => Ok(results.iter().map(|jv| jv.dump(PrintFlags::NONE)).collect()),
        }
    }

    /// Serves one [`Jq::start`] stream until its input channel closes.
    ///
    /// The stream's handler replaces the user's for the whole run and
    /// turns every runtime error into a [`JqError::Reported`] on `errors`.
    /// Compile failures arrive there as a single error before any input is
    /// read; inputs sent after a failed compile are discarded.
    fn handle_stream(
        &mut self,
        program: &str,
        args: &Value,
        inputs: Receiver<Value>,
        outputs: Sender<Value>,
        errors: Sender<JqError>,
        reply: Sender<CallbackId>,
    ) {
        let sink = errors.clone();
        let stream_id = Registry::global().register(move |err: Jv| {
            let msg = err
                .format_error()
                .unwrap_or_else(|| "unknown jq error".to_string());
            let _ = sink.send(JqError::Reported(msg));
        });
        let saved = self.handler.take();
        let _ = reply.send(stream_id);

        let compiled = self.handle_compile(program, args);
        self.handler = Some(stream_id);
        self.restore_error_cb();
        log::debug!("jq stream {} started", stream_id);

        match compiled {
            Ok(()) => {
                for input in inputs.iter() {
                    if let Err(e) = self.stream_one(&input, &outputs) {
                        let _ = errors.send(e);
                    }
                }
            }
            Err(e) => {
                let _ = errors.send(e);
                for _ in inputs.iter() {}
            }
        }

        self.handler = saved;
        self.restore_error_cb();
        Registry::global().unregister(stream_id);
        log::debug!("jq stream {} finished", stream_id);
    }

    // A runtime failure has already reached the stream's handler.
    fn stream_one(&self, input: &Value, outputs: &Sender<Value>) -> Result<()> {
        let (results, _) = self.run(Jv::from_value(self.lib, input)?)?;
        for result in &results {
            let _ = outputs.send(result.to_value()?);
        }
        Ok(())
    }

    fn handle_set_error_handler(&mut self, id: Option<CallbackId>) {
        if let Some(previous) = self.handler.take() {
            Registry::global().unregister(previous);
        }
        self.handler = id;
        self.restore_error_cb();
    }

    fn close(&mut self) {
        if !self.state.is_null() {
            unsafe {
                callback::reset_to_default(self.lib, self.state);
                (self.lib.jq_teardown)(&mut self.state);
            }
            self.state = std::ptr::null_mut();
        }
        if let Some(id) = self.handler.take() {
            Registry::global().unregister(id);
        }
    }
}

/// A libjq engine instance.
///
/// All FFI calls are executed in a dedicated worker thread that owns the
/// `jq_state`, so error handlers run on that thread.
///
/// The engine is torn down when this struct is dropped.
pub struct Jq {
    sender: Sender<FfiCommand>,
    worker: Option<JoinHandle<()>>,
}

fn worker_died() -> JqError {
    JqError::OperationFailed("worker thread died".to_string())
}

impl Jq {
    /// Creates a new engine, loading libjq on first use.
    pub fn new() -> Result<Self> {
        let (tx, rx): (Sender<FfiCommand>, Receiver<FfiCommand>) = mpsc::channel();

        // Channel to receive initialization result from worker
        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name("jq-ffi-worker".to_string())
            .stack_size(FFI_THREAD_STACK_SIZE)
            .spawn(move || match Self::init_worker() {
                Ok(mut state) => {
                    let _ = init_tx.send(Ok(()));
                    Self::run_worker_loop(&mut state, rx);
                    state.close();
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| JqError::OperationFailed(e.to_string()))?;

        init_rx.recv().map_err(|_| JqError::InitFailed)??;

        Ok(Jq {
            sender: tx,
            worker: Some(worker),
        })
    }

    fn init_worker() -> Result<FfiWorkerState> {
        let lib = ffi::get_library()?;

        let state = unsafe { (lib.jq_init)() };
        if state.is_null() {
            return Err(JqError::InitFailed);
        }

        Ok(FfiWorkerState {
            lib,
            state,
            handler: None,
            compiled: false,
        })
    }

    fn run_worker_loop(state: &mut FfiWorkerState, rx: Receiver<FfiCommand>) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                FfiCommand::Compile {
                    program,
                    args,
                    reply,
                } => {
                    let _ = reply.send(state.handle_compile(&program, &args));
                }
                FfiCommand::Execute { input, reply } => {
                    let _ = reply.send(state.handle_execute(&input));
                }
                FfiCommand::ExecuteJson { input, reply } => {
                    let _ = reply.send(state.handle_execute_json(&input));
                }
                FfiCommand::SetErrorHandler { id, reply } => {
                    state.handle_set_error_handler(id);
                    let _ = reply.send(());
                }
                FfiCommand::Start {
                    program,
                    args,
                    inputs,
                    outputs,
                    errors,
                    reply,
                } => {
                    state.handle_stream(&program, &args, inputs, outputs, errors, reply);
                }
                FfiCommand::Shutdown => break,
            }
        }
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> FfiCommand) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender
            .send(make(reply_tx))
            .map_err(|_| worker_died())?;
        reply_rx.recv().map_err(|_| worker_died())
    }

    /// Compiles `program`, replacing any previously compiled one.
    ///
    /// `args` binds named variables and must be an array or an object; for
    /// an object `{"n": 1}` the program sees `$n`.
    pub fn compile(&self, program: &str, args: &Value) -> Result<()> {
        check_args(args)?;
        self.request(|reply| FfiCommand::Compile {
            program: program.to_string(),
            args: args.clone(),
            reply,
        })?
    }

    /// Runs the compiled program against one input and returns every output.
    ///
    /// An uncaught error ends the run with [`JqError::ExecutionFailed`],
    /// which carries the outputs produced before it.
    pub fn execute(&self, input: &Value) -> Result<Vec<Value>> {
        self.request(|reply| FfiCommand::Execute {
            input: input.clone(),
            reply,
        })?
    }

    /// Like [`Jq::execute`], with JSON text in and compact JSON text out.
    pub fn execute_json(&self, input: &str) -> Result<Vec<String>> {
        self.request(|reply| FfiCommand::ExecuteJson {
            input: input.to_string(),
            reply,
        })?
    }

    /// Routes errors this engine reports to `handler`.
    ///
    /// The handler sees every compile diagnostic libjq reports through its
    /// error callback, and the uncaught runtime error that ends an
    /// [`execute`](Jq::execute) call. Those errors are still returned from
    /// `compile` and `execute` as well.
    ///
    /// Replaces any handler set earlier. The handler runs on the engine's
    /// worker thread.
    pub fn set_error_handler<F>(&self, handler: F) -> Result<CallbackId>
    where
        F: FnMut(Jv) + Send + 'static,
    {
        let id = Registry::global().register(handler);
        match self.request(|reply| FfiCommand::SetErrorHandler { id: Some(id), reply }) {
            Ok(()) => Ok(id),
            Err(e) => {
                Registry::global().unregister(id);
                Err(e)
            }
        }
    }

    /// Restores libjq's built-in error handling.
    pub fn clear_error_handler(&self) -> Result<()> {
        self.request(|reply| FfiCommand::SetErrorHandler { id: None, reply })
    }

    /// Compiles `program` and runs it over every value sent on the
    /// returned stream's `inputs`.
    ///
    /// Outputs arrive on `outputs`; compile failures and runtime errors
    /// arrive on `errors`. Both channels close once `inputs` is dropped
    /// and the last input has been processed. While the stream is open the
    /// engine serves nothing else: other calls on this `Jq`, including
    /// dropping it, wait for the stream to finish. Any handler set with
    /// [`set_error_handler`](Jq::set_error_handler) is suspended for the
    /// stream's lifetime and reinstalled afterwards.
    pub fn start(&self, program: &str, args: &Value) -> Result<JqStream> {
        check_args(args)?;
        let (input_tx, input_rx) = mpsc::channel();
        let (output_tx, output_rx) = mpsc::channel();
        let (error_tx, error_rx) = mpsc::channel();
        let id = self.request(|reply| FfiCommand::Start {
            program: program.to_string(),
            args: args.clone(),
            inputs: input_rx,
            outputs: output_tx,
            errors: error_tx,
            reply,
        })?;
        Ok(JqStream {
            id,
            inputs: input_tx,
            outputs: output_rx,
            errors: error_rx,
        })
    }
}

/// The channels of a program started with [`Jq::start`].
pub struct JqStream {
    /// Registry handler that receives the engine's errors while the stream
    /// runs. Unregistered when the stream finishes.
    pub id: CallbackId,
    pub inputs: Sender<Value>,
    pub outputs: Receiver<Value>,
    pub errors: Receiver<JqError>,
}

impl Drop for Jq {
    fn drop(&mut self) {
        let _ = self.sender.send(FfiCommand::Shutdown);

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn check_args(args: &Value) -> Result<()> {
    match args {
        Value::Array(_) | Value::Object(_) => Ok(()),
        other => Err(JqError::WrongType(format!(
            "`args` parameter is of type {} not array or object",
            value_kind(other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compiles `program` with `args` and runs it against `input`.
pub fn exec(program: &str, args: &Value, input: &Value) -> Result<Vec<Value>> {
    let jq = Jq::new()?;
    jq.compile(program, args)?;
    jq.execute(input)
}

/// Like [`exec`], with JSON text in and compact JSON text out.
pub fn exec_json(program: &str, args: &str, input: &str) -> Result<Vec<String>> {
    let args: Value = serde_json::from_str(args)?;
    let jq = Jq::new()?;
    jq.compile(program, &args)?;
    jq.execute_json(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Option<Jq> {
        ffi::test_library()?;
        Some(Jq::new().unwrap())
    }

    #[test]
    fn test_error_display() {
        let err = JqError::NotCompiled;
        assert_eq!(err.to_string(), "no program has been compiled");
    }

    #[test]
    fn test_error_setup_failed() {
        let err = JqError::SetupFailed("not found".to_string());
        assert_eq!(err.to_string(), "library setup failed: not found");
    }

    #[test]
    fn test_error_compile_failed_joins_messages() {
        let err = JqError::CompileFailed(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "compile failed: a; b");
    }

    #[test]
    fn test_error_execution_failed() {
        let err = JqError::ExecutionFailed {
            message: "boom".to_string(),
            outputs: vec![json!(1)],
        };
        assert_eq!(err.to_string(), "execution failed: boom");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<Value>("invalid").unwrap_err();
        let err: JqError = json_err.into();

        match err {
            JqError::JsonError(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected JsonError variant"),
        }
    }

    #[test]
    fn test_check_args_accepts_array_and_object() {
        assert!(check_args(&json!([])).is_ok());
        assert!(check_args(&json!({"n": 1})).is_ok());
    }

    #[test]
    fn test_check_args_rejects_scalars() {
        match check_args(&json!("nope")) {
            Err(JqError::WrongType(msg)) => assert!(msg.contains("string"), "{}", msg),
            other => panic!("Expected WrongType, got {:?}", other),
        }
    }

    #[test]
    fn test_cstring_with_null_byte() {
        match FfiWorkerState::cstring("a\0b") {
            Err(JqError::OperationFailed(msg)) => assert!(msg.contains("nul")),
            other => panic!("Expected OperationFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_new_fails_only_without_library() {
        match (ffi::test_library(), Jq::new()) {
            (Some(_), Ok(_)) => {}
            (None, Err(JqError::SetupFailed(msg))) => {
                assert!(msg.contains("libjq could not be loaded"), "{}", msg)
            }
            (Some(_), Err(e)) => panic!("libjq loads but Jq::new failed: {}", e),
            (None, other) => panic!("Expected SetupFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_compile_and_execute() {
        let Some(jq) = engine() else { return };
        jq.compile(".[] | .name", &json!([])).unwrap();
        let out = jq
            .execute(&json!([{"name": "Alice"}, {"name": "Bob"}]))
            .unwrap();
        assert_eq!(out, vec![json!("Alice"), json!("Bob")]);
    }

    #[test]
    fn test_execute_before_compile() {
        let Some(jq) = engine() else { return };
        assert!(matches!(jq.execute(&json!(1)), Err(JqError::NotCompiled)));
    }

    #[test]
    fn test_named_args_are_bound() {
        let Some(jq) = engine() else { return };
        jq.compile(". + $n", &json!({"n": 2})).unwrap();
        assert_eq!(jq.execute(&json!(40)).unwrap(), vec![json!(42)]);
    }

    #[test]
    fn test_compile_errors_are_collected() {
        let Some(jq) = engine() else { return };
        match jq.compile(".a |||", &json!([])) {
            Err(JqError::CompileFailed(errors)) => {
                assert!(!errors.is_empty());
                assert!(errors.iter().any(|e| e.contains("error")), "{:?}", errors);
            }
            other => panic!("Expected CompileFailed, got {:?}", other),
        }
        assert!(matches!(jq.execute(&json!(1)), Err(JqError::NotCompiled)));
    }

    #[test]
    fn test_runtime_error_is_returned() {
        let Some(jq) = engine() else { return };
        jq.compile(". + \"a\"", &json!([])).unwrap();
        match jq.execute(&json!(1)) {
            Err(JqError::ExecutionFailed { message, outputs }) => {
                assert!(message.contains("cannot be added"), "{}", message);
                assert!(outputs.is_empty());
            }
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_error_keeps_earlier_outputs() {
        let Some(jq) = engine() else { return };
        jq.compile(".[] | if . == 0 then error(\"zero\") else 1 / . end", &json!([]))
            .unwrap();
        match jq.execute(&json!([1, 2, 0, 4])) {
            Err(JqError::ExecutionFailed { message, outputs }) => {
                assert!(message.contains("zero"), "{}", message);
                assert_eq!(outputs, vec![json!(1), json!(0.5)]);
            }
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }

        match jq.execute_json("[4, \"x\", 8]") {
            Err(JqError::ExecutionFailed { outputs, .. }) => assert_eq!(outputs, vec![json!(0.25)]),
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_recompile_replaces_program() {
        let Some(jq) = engine() else { return };
        jq.compile(".a", &json!([])).unwrap();
        jq.compile(".b", &json!([])).unwrap();
        assert_eq!(jq.execute(&json!({"a": 1, "b": 2})).unwrap(), vec![json!(2)]);
    }

    #[test]
    fn test_execute_json_dumps_compact() {
        let Some(jq) = engine() else { return };
        jq.compile("{x: .}", &json!([])).unwrap();
        assert_eq!(jq.execute_json("[1, 2]").unwrap(), vec!["{\"x\":[1,2]}"]);
        assert!(matches!(jq.execute_json("[1,"), Err(JqError::InvalidJson(_))));
    }

    #[test]
    fn test_error_handler_sees_compile_diagnostics() {
        let Some(jq) = engine() else { return };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = jq
            .set_error_handler(move |err: Jv| sink.lock().unwrap().push(err.format_error()))
            .unwrap();
        assert!(Registry::global().contains(id));

        let errors = match jq.compile("|||", &json!([])) {
            Err(JqError::CompileFailed(errors)) => errors,
            other => panic!("Expected CompileFailed, got {:?}", other),
        };
        let seen_now: Vec<String> = seen.lock().unwrap().iter().flatten().cloned().collect();
        assert_eq!(seen_now, errors);

        jq.clear_error_handler().unwrap();
        assert!(!Registry::global().contains(id));
        assert!(jq.compile("|||", &json!([])).is_err());
        assert_eq!(seen.lock().unwrap().len(), errors.len());
    }

    #[test]
    fn test_type_mismatch_reaches_handler_exactly_once() {
        let Some(jq) = engine() else { return };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = jq
            .set_error_handler(move |err: Jv| sink.lock().unwrap().push(err.format_error()))
            .unwrap();

        jq.compile(". + \"a\"", &json!([])).unwrap();
        assert!(jq.execute(&json!(1)).is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "handler {} saw {:?}", id, *seen);
        let msg = seen[0].as_deref().unwrap_or_default();
        assert!(msg.contains("cannot be added"), "{}", msg);
    }

    #[test]
    fn test_replacing_error_handler_unregisters_previous() {
        let Some(jq) = engine() else { return };
        let first = jq.set_error_handler(|_| {}).unwrap();
        let second = jq.set_error_handler(|_| {}).unwrap();
        assert_ne!(first, second);
        assert!(!Registry::global().contains(first));
        assert!(Registry::global().contains(second));

        drop(jq);
        assert!(!Registry::global().contains(second));
    }

    #[test]
    fn test_jq_is_send() {
        let Some(jq) = engine() else { return };
        let handle = thread::spawn(move || {
            jq.compile("length", &json!([])).unwrap();
            jq.execute(&json!("four")).unwrap()
        });
        assert_eq!(handle.join().unwrap(), vec![json!(4)]);
    }

    #[test]
    fn test_stream_handler_lives_until_inputs_close() {
        let Some(jq) = engine() else { return };
        let JqStream {
            id,
            inputs,
            outputs,
            errors,
        } = jq.start(".a", &json!([])).unwrap();
        assert!(Registry::global().contains(id));

        inputs.send(json!({"a": 1})).unwrap();
        inputs.send(json!(5)).unwrap();
        inputs.send(json!({"a": "x"})).unwrap();
        assert!(Registry::global().contains(id));
        drop(inputs);

        let outs: Vec<Value> = outputs.iter().collect();
        assert_eq!(outs, vec![json!(1), json!("x")]);
        let errs: Vec<JqError> = errors.iter().collect();
        assert_eq!(errs.len(), 1, "{:?}", errs);
        match &errs[0] {
            JqError::Reported(msg) => assert!(msg.contains("Cannot index number"), "{}", msg),
            other => panic!("Expected Reported, got {:?}", other),
        }
        assert!(!Registry::global().contains(id));
    }

    #[test]
    fn test_stream_compile_failure_and_handler_restore() {
        let Some(jq) = engine() else { return };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let user = jq
            .set_error_handler(move |err: Jv| sink.lock().unwrap().push(err.format_error()))
            .unwrap();

        let stream = jq.start("|||", &json!([])).unwrap();
        stream.inputs.send(json!(1)).unwrap();
        drop(stream.inputs);
        assert!(stream.outputs.iter().next().is_none());
        let errs: Vec<JqError> = stream.errors.iter().collect();
        assert!(
            matches!(errs.as_slice(), [JqError::CompileFailed(e)] if !e.is_empty()),
            "{:?}",
            errs
        );
        assert!(seen.lock().unwrap().is_empty());

        assert!(Registry::global().contains(user));
        jq.compile(". + \"a\"", &json!([])).unwrap();
        assert!(jq.execute(&json!(1)).is_err());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_start_rejects_scalar_args() {
        let Some(jq) = engine() else { return };
        assert!(matches!(jq.start(".", &json!(1)), Err(JqError::WrongType(_))));
    }

    #[test]
    fn test_exec_one_shot() {
        if ffi::test_library().is_none() {
            return;
        }
        let out = exec("map(. * 2)", &json!([]), &json!([1, 2, 3])).unwrap();
        assert_eq!(out, vec![json!([2, 4, 6])]);
    }

    #[test]
    fn test_exec_json_rejects_scalar_args() {
        if ffi::test_library().is_none() {
            return;
        }
        assert!(matches!(
            exec_json(".", "1", "null"),
            Err(JqError::WrongType(_))
        ));
        assert_eq!(exec_json(".", "[]", "\"hi\"").unwrap(), vec!["\"hi\""]);
    }
}
