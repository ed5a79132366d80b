use super::{
    CallState, Completion, InjectedFunction, InjectionError, InjectionKind, InvocationContext,
    Sandbox, ScriptLogger, ScriptValidator,
};
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Granularity at which blocking host helpers look at the cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(10);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Quiet period that ends a `tcp_request` reply.
const TCP_REPLY_IDLE: Duration = Duration::from_millis(100);

/// Rhai-backed sandbox. Every invocation builds a fresh engine so no script
/// can observe another script's globals.
pub struct RhaiSandbox {
    validator: ScriptValidator,
    max_operations: u64,
}

impl RhaiSandbox {
    pub fn new(max_operations: u64) -> Self {
        Self {
            validator: ScriptValidator::new(),
            max_operations,
        }
    }

    fn create_engine(&self, ctx: &InvocationContext) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        register_host_api(&mut engine);

        let watch = ctx.clone();
        engine.on_progress(move |_ops| {
            if watch.is_cancelled() {
                Some(Dynamic::from("cancelled"))
            } else {
                None
            }
        });

        let watch = ctx.clone();
        engine.register_fn("sleep", move |ms: i64| -> Result<(), Box<EvalAltResult>> {
            cancellable_sleep(Duration::from_millis(ms.max(0) as u64), &watch)
                .map_err(|_| "sleep interrupted: injection cancelled".into())
        });

        let watch = ctx.clone();
        engine.register_fn(
            "tcp_request",
            move |address: &str, payload: &str| -> Result<String, Box<EvalAltResult>> {
                tcp_request(address, payload.as_bytes(), &watch)
                    .map_err(|e| format!("tcp_request to {address} failed: {e}").into())
            },
        );

        engine
    }

    fn invoke(
        &self,
        function: &InjectedFunction,
        args: Vec<Dynamic>,
        ctx: &InvocationContext,
    ) -> Result<Dynamic, InjectionError> {
        let engine = self.create_engine(ctx);
        let kind = function.kind;
        let closure: FnPtr = engine
            .eval_ast(&function.ast)
            .map_err(|e| map_eval_error(kind, *e, ctx))?;
        closure
            .call::<Dynamic>(&engine, &function.ast, args)
            .map_err(|e| map_eval_error(kind, *e, ctx))
    }
}

impl Sandbox for RhaiSandbox {
    fn compile(&self, kind: InjectionKind, source: &str) -> Result<InjectedFunction, InjectionError> {
        self.validator.validate(kind, source)
    }

    fn evaluate_predicate(
        &self,
        function: &InjectedFunction,
        request: &Value,
        ctx: &InvocationContext,
    ) -> Result<bool, InjectionError> {
        let mut args = vec![json_to_dynamic(request.clone())];
        if function.arity > 1 {
            args.push(Dynamic::from(ScriptLogger::new(ctx.port, function.kind)));
        }
        let result = self.invoke(function, args, ctx)?;
        result.as_bool().map_err(|found| InjectionError::InvalidReturn {
            kind: function.kind,
            expected: "a boolean",
            found: found.to_string(),
        })
    }

    fn evaluate_response(
        &self,
        function: &InjectedFunction,
        request: &Value,
        state: &CallState,
        completion: Completion,
        ctx: &InvocationContext,
    ) -> Result<Option<Value>, InjectionError> {
        let kind = function.kind;
        let mut args = vec![
            json_to_dynamic(request.clone()),
            Dynamic::from(state.clone()),
            Dynamic::from(ScriptLogger::new(ctx.port, kind)),
        ];
        if function.is_async() {
            let callback = completion
                .into_fn_ptr()
                .map_err(|e| map_eval_error(kind, *e, ctx))?;
            args.push(Dynamic::from(callback));
        }
        args.truncate(function.arity);

        let result = self.invoke(function, args, ctx)?;
        if function.is_async() {
            return Ok(None);
        }
        if result.is_map() {
            return Ok(Some(dynamic_to_json(result)));
        }
        Err(InjectionError::InvalidReturn {
            kind,
            expected: "a response object",
            found: result.type_name().to_string(),
        })
    }

    fn evaluate_frame_boundary(
        &self,
        function: &InjectedFunction,
        buffer: &[u8],
        ctx: &InvocationContext,
    ) -> Result<bool, InjectionError> {
        let mut args = vec![Dynamic::from_blob(buffer.to_vec())];
        if function.arity > 1 {
            args.push(Dynamic::from(ScriptLogger::new(ctx.port, function.kind)));
        }
        let result = self.invoke(function, args, ctx)?;
        result.as_bool().map_err(|found| InjectionError::InvalidReturn {
            kind: function.kind,
            expected: "a boolean",
            found: found.to_string(),
        })
    }
}

/// Types and functions every engine exposes, including the compile-only one.
pub(super) fn register_host_api(engine: &mut Engine) {
    engine.disable_symbol("eval");
    CallState::register(engine);
    Completion::register(engine);
    ScriptLogger::register(engine);
}

fn map_eval_error(kind: InjectionKind, error: EvalAltResult, ctx: &InvocationContext) -> InjectionError {
    if ctx.is_cancelled() || matches!(error, EvalAltResult::ErrorTerminated(..)) {
        return InjectionError::Cancelled { kind };
    }
    InjectionError::Runtime {
        kind,
        message: error.to_string(),
    }
}

fn cancellable_sleep(duration: Duration, ctx: &InvocationContext) -> Result<(), ()> {
    let deadline = Instant::now() + duration;
    loop {
        if ctx.is_cancelled() {
            return Err(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

/// Blocking request/reply against a TCP peer.
///
/// The reply ends when the peer closes or goes quiet after sending something.
fn tcp_request(address: &str, payload: &[u8], ctx: &InvocationContext) -> std::io::Result<String> {
    let address = address.strip_prefix("tcp://").unwrap_or(address);
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "address did not resolve")
    })?;
    let mut stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)?;
    stream.write_all(payload)?;
    stream.set_read_timeout(Some(CANCEL_POLL))?;

    let mut received = Vec::new();
    let mut buf = [0u8; 8192];
    let mut quiet_since: Option<Instant> = None;
    loop {
        if ctx.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "injection cancelled",
            ));
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                quiet_since = None;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if received.is_empty() {
                    continue;
                }
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= TCP_REPLY_IDLE {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&received).into_owned())
}

pub(super) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub(super) fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        Value::Number(serde_json::Number::from_f64(f).unwrap_or(0.into()))
    } else if value.is_string() {
        Value::String(value.to_string())
    } else if value.is_blob() {
        let bytes = value.cast::<rhai::Blob>();
        Value::Array(bytes.into_iter().map(Value::from).collect())
    } else if let Some(arr) = value.clone().try_cast::<Vec<Dynamic>>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        Value::Object(obj)
    } else {
        Value::String(format!("{value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> RhaiSandbox {
        RhaiSandbox::new(1_000_000)
    }

    fn compile(kind: InjectionKind, source: &str) -> InjectedFunction {
        sandbox().compile(kind, source).unwrap()
    }

    #[test]
    fn test_predicate_returns_bool() {
        let function = compile(InjectionKind::Predicate, r#"|request| request.data == "test""#);
        let ctx = InvocationContext::new(4545);
        let sandbox = sandbox();
        assert!(sandbox
            .evaluate_predicate(&function, &json!({"data": "test"}), &ctx)
            .unwrap());
        assert!(!sandbox
            .evaluate_predicate(&function, &json!({"data": "other"}), &ctx)
            .unwrap());
    }

    #[test]
    fn test_predicate_non_bool_is_error() {
        let function = compile(InjectionKind::Predicate, "|request| request.data");
        let result = sandbox().evaluate_predicate(
            &function,
            &json!({"data": "test"}),
            &InvocationContext::new(4545),
        );
        assert!(matches!(result, Err(InjectionError::InvalidReturn { .. })));
    }

    #[test]
    fn test_predicate_throw_is_runtime_error() {
        let function = compile(InjectionKind::Predicate, r#"|request| throw "boom""#);
        let result =
            sandbox().evaluate_predicate(&function, &json!({}), &InvocationContext::new(4545));
        assert!(matches!(result, Err(InjectionError::Runtime { .. })));
    }

    #[test]
    fn test_sync_response_transforms_request() {
        let function = compile(
            InjectionKind::Response,
            r#"|request, state, logger| #{ data: request.data + " INJECTED" }"#,
        );
        let (completion, _rx) = Completion::channel(4545);
        let result = sandbox()
            .evaluate_response(
                &function,
                &json!({"data": "request"}),
                &CallState::new(),
                completion,
                &InvocationContext::new(4545),
            )
            .unwrap();
        assert_eq!(result, Some(json!({"data": "request INJECTED"})));
    }

    #[test]
    fn test_state_persists_between_calls() {
        let function = compile(
            InjectionKind::Response,
            r#"|request, state| {
                if !state.contains("count") { state["count"] = 0; }
                state["count"] += 1;
                #{ data: state["count"].to_string() }
            }"#,
        );
        let sandbox = sandbox();
        let state = CallState::new();
        let ctx = InvocationContext::new(4545);
        for expected in ["1", "2", "3"] {
            let (completion, _rx) = Completion::channel(4545);
            let result = sandbox
                .evaluate_response(&function, &json!({}), &state, completion, &ctx)
                .unwrap();
            assert_eq!(result, Some(json!({ "data": expected })));
        }
    }

    #[test]
    fn test_sync_response_non_object_is_error() {
        let function = compile(InjectionKind::Response, "|request| 42");
        let (completion, _rx) = Completion::channel(4545);
        let result = sandbox().evaluate_response(
            &function,
            &json!({}),
            &CallState::new(),
            completion,
            &InvocationContext::new(4545),
        );
        assert!(matches!(result, Err(InjectionError::InvalidReturn { .. })));
    }

    #[tokio::test]
    async fn test_async_response_completes_through_callback() {
        let function = compile(
            InjectionKind::Response,
            r#"|request, state, logger, callback| {
                logger.info("completing");
                callback.call(#{ data: "async " + request.data });
                "ignored"
            }"#,
        );
        let (completion, rx) = Completion::channel(4545);
        let result = sandbox()
            .evaluate_response(
                &function,
                &json!({"data": "hello"}),
                &CallState::new(),
                completion,
                &InvocationContext::new(4545),
            )
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(rx.await.unwrap(), json!({"data": "async hello"}));
    }

    #[tokio::test]
    async fn test_async_response_without_callback_drops_completion() {
        let function = compile(InjectionKind::Response, "|request, state, logger, callback| ()");
        let (completion, rx) = Completion::channel(4545);
        let result = sandbox()
            .evaluate_response(
                &function,
                &json!({}),
                &CallState::new(),
                completion,
                &InvocationContext::new(4545),
            )
            .unwrap();
        assert_eq!(result, None);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_frame_boundary_reads_length_prefix() {
        let function = compile(
            InjectionKind::FrameBoundary,
            r#"|bytes| bytes.len() >= 4 && bytes.len() == 4 + bytes.parse_le_int(0, 4)"#,
        );
        let sandbox = sandbox();
        let ctx = InvocationContext::new(4545);
        let mut frame = 3_u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"ab");
        assert!(!sandbox.evaluate_frame_boundary(&function, &frame, &ctx).unwrap());
        frame.push(b'c');
        assert!(sandbox.evaluate_frame_boundary(&function, &frame, &ctx).unwrap());
    }

    #[test]
    fn test_operation_budget_stops_infinite_loop() {
        let function = compile(InjectionKind::Predicate, "|request| { loop { } }");
        let result =
            sandbox().evaluate_predicate(&function, &json!({}), &InvocationContext::new(4545));
        assert!(matches!(result, Err(InjectionError::Runtime { .. })));
    }

    #[test]
    fn test_cancel_flag_interrupts_sleep() {
        let function = compile(InjectionKind::Predicate, "|request| { sleep(60000); true }");
        let ctx = InvocationContext::new(4545);
        let canceller = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let started = Instant::now();
        let result = sandbox().evaluate_predicate(&function, &json!({}), &ctx);
        assert!(matches!(result, Err(InjectionError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_json_dynamic_conversion() {
        let value = json!({"a": 1, "b": [true, "x"], "c": null});
        assert_eq!(dynamic_to_json(json_to_dynamic(value.clone())), value);
    }
}
