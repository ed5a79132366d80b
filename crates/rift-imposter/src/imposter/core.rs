//! Core Imposter struct and request resolution.
//!
//! An [`Imposter`] owns everything one listening port needs: compiled stubs,
//! the request ledger, its lifecycle state and the tasks serving connections.
//! Protocol handlers decode a [`Request`] and call [`Imposter::resolve`]; the
//! returned [`Reply`] is theirs to write.

use super::response::{failure_reply, payload_to_reply, CompiledKind};
use super::stubs::{StubRecord, StubStore};
use super::types::{
    CompileEnv, ImposterConfig, ImposterError, ImposterState, Protocol, ProxyResponse,
};
use super::{handler, smtp, tcp};
use crate::config::EngineConfig;
use crate::framing::{Boundary, FrameStrategy, FramingConfig, ResolverBoundary};
use crate::ledger::{LedgerEntry, Outcome, RequestLedger};
use crate::message::{Mode, Reply, Request};
use crate::metrics;
use crate::predicate::EvalContext;
use crate::proxy::{HttpUpstream, ProxyError, TcpUpstream, Upstream};
use crate::recording::{generate_predicates, recorded_stub};
use crate::scripting::{
    Completion, InjectedFunction, InjectionError, InjectionKind, InvocationContext, RhaiSandbox,
    Sandbox,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Services shared by every imposter an engine creates.
pub struct EngineContext {
    pub config: EngineConfig,
    pub sandbox: Arc<dyn Sandbox>,
    pub http_upstream: Arc<dyn Upstream>,
    pub tcp_upstream: Arc<dyn Upstream>,
}

impl EngineContext {
    /// Rhai sandbox and real upstream clients configured from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, ProxyError> {
        let sandbox = Arc::new(RhaiSandbox::new(config.max_script_operations));
        let http_upstream = Arc::new(HttpUpstream::new(config.proxy_timeout())?);
        let tcp_upstream = Arc::new(TcpUpstream::new(config.tcp_proxy_idle()));
        Ok(Self {
            config,
            sandbox,
            http_upstream,
            tcp_upstream,
        })
    }

    fn upstream(&self, protocol: Protocol) -> Option<&Arc<dyn Upstream>> {
        match protocol {
            Protocol::Tcp => Some(&self.tcp_upstream),
            Protocol::Http => Some(&self.http_upstream),
            Protocol::Smtp => None,
        }
    }
}

/// A running imposter instance
pub struct Imposter {
    pub config: ImposterConfig,
    port: u16,
    stubs: StubStore,
    default_reply: Reply,
    framing: FramingConfig,
    resolver: Option<InjectedFunction>,
    /// Set when any predicate may run injected code
    injected_predicates: bool,
    ledger: RequestLedger,
    state: Mutex<ImposterState>,
    engine: Arc<EngineContext>,
    /// Parent of every script invocation; cancelled when in-flight work is abandoned
    scripts: InvocationContext,
    /// Stop accepting connections and reading new requests
    shutdown: CancellationToken,
    /// Abandon requests still being resolved
    abort: CancellationToken,
    tasks: TaskTracker,
    serve_handle: Mutex<Option<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
}

impl Imposter {
    /// Validate and compile a declaration. Nothing is bound yet, so a failure
    /// here leaves no trace.
    pub fn compile(config: ImposterConfig, engine: Arc<EngineContext>) -> Result<Self, ImposterError> {
        let protocol = config.protocol;
        let mode = config.mode;

        if protocol != Protocol::Tcp {
            if mode != Mode::Text {
                return Err(ImposterError::BadData(format!(
                    "mode is only supported for tcp imposters, not {protocol}"
                )));
            }
            if config.framing.is_some() || config.end_of_request_resolver.is_some() {
                return Err(ImposterError::BadData(format!(
                    "framing is only supported for tcp imposters, not {protocol}"
                )));
            }
        }
        if protocol == Protocol::Smtp && !config.stubs.is_empty() {
            return Err(ImposterError::BadData(
                "smtp imposters record mail and do not accept stubs".to_string(),
            ));
        }

        let env = CompileEnv {
            protocol,
            mode,
            allow_injection: engine.config.allow_injection,
            sandbox: engine.sandbox.as_ref(),
        };

        let resolver = config
            .end_of_request_resolver
            .as_ref()
            .map(|r| env.compile_injection(InjectionKind::FrameBoundary, &r.inject))
            .transpose()?;
        let framing = config.framing.clone().unwrap_or_default();
        if let FramingConfig::Delimiter { delimiter } = &framing {
            let parsed = mode
                .parse(delimiter)
                .map_err(|e| ImposterError::BadData(format!("invalid delimiter: {e}")))?;
            if parsed.is_empty() {
                return Err(ImposterError::BadData("delimiter must not be empty".to_string()));
            }
        }

        let stubs = StubStore::compile(&config.stubs, &env)?;
        let injected_predicates = stubs
            .snapshot()
            .iter()
            .any(|record| record.predicates.iter().any(|p| p.is_injected()));

        let default_reply = match (&config.default_response, protocol) {
            (_, Protocol::Smtp) => Reply::Bytes(Default::default()),
            (Some(payload), _) => {
                payload_to_reply(protocol, mode, payload).map_err(ImposterError::BadData)?
            }
            (None, _) => {
                payload_to_reply(protocol, mode, &json!({})).map_err(ImposterError::BadData)?
            }
        };

        let port = config.port.unwrap_or(0);
        Ok(Self {
            config,
            port,
            stubs,
            default_reply,
            framing,
            resolver,
            injected_predicates,
            ledger: RequestLedger::new(),
            state: Mutex::new(ImposterState::Created),
            engine,
            scripts: InvocationContext::new(port),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
            serve_handle: Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    /// Record the port actually bound.
    pub(crate) fn bind_port(&mut self, port: u16) {
        self.port = port;
        self.config.port = Some(port);
        self.scripts = InvocationContext::new(port);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn state(&self) -> ImposterState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ImposterState) {
        *self.state.lock() = state;
    }

    pub fn stubs(&self) -> &StubStore {
        &self.stubs
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<LedgerEntry> {
        self.ledger.snapshot()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    fn compile_env(&self) -> CompileEnv<'_> {
        CompileEnv {
            protocol: self.protocol(),
            mode: self.mode(),
            allow_injection: self.engine.config.allow_injection,
            sandbox: self.engine.sandbox.as_ref(),
        }
    }

    /// Framing for a fresh tcp connection.
    pub(crate) fn frame_strategy(&self) -> FrameStrategy {
        if let Some(function) = &self.resolver {
            return FrameStrategy::Resolver(ResolverBoundary {
                function: function.clone(),
                sandbox: Arc::clone(&self.engine.sandbox),
                ctx: self.scripts.child(),
            });
        }
        FrameStrategy::Builtin(match &self.framing {
            FramingConfig::Packet => Boundary::Packet,
            FramingConfig::Connection => Boundary::Connection,
            FramingConfig::Delimiter { delimiter } => Boundary::Delimiter(
                self.mode()
                    .parse(delimiter)
                    .map(|b| b.to_vec())
                    .unwrap_or_default(),
            ),
        })
    }

    /// JSON description: declaration, state and, optionally, the ledger.
    pub fn describe(&self, include_requests: bool) -> Value {
        let mut description = json!({
            "protocol": self.protocol(),
            "port": self.port,
            "state": self.state(),
            "mode": self.mode(),
            "createdAt": self.created_at,
            "numberOfRequests": self.ledger.len(),
            "stubs": self.stubs.declared(),
        });
        if let Some(name) = &self.config.name {
            description["name"] = json!(name);
        }
        if let Some(host) = &self.config.host {
            description["host"] = json!(host);
        }
        if let Some(framing) = &self.config.framing {
            description["framing"] = json!(framing);
        }
        if let Some(resolver) = &self.config.end_of_request_resolver {
            description["endOfRequestResolver"] = json!(resolver);
        }
        if let Some(default_response) = &self.config.default_response {
            description["defaultResponse"] = default_response.clone();
        }
        if include_requests {
            description["requests"] = json!(self.ledger.snapshot());
        }
        description
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Start accepting connections on `listener`.
    pub(crate) fn start(self: &Arc<Self>, listener: TcpListener) {
        let imposter = Arc::clone(self);
        let handle = tokio::spawn(async move { imposter.serve(listener).await });
        *self.serve_handle.lock() = Some(handle);
        self.set_state(ImposterState::Running);
        metrics::imposter_started(self.protocol().as_str());
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let imposter = Arc::clone(&self);
                        self.tasks.spawn(async move {
                            imposter.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", self.port, e);
                    }
                }
            }
        }
        debug!("Imposter on port {} stopped accepting connections", self.port);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!("Connection from {} on port {}", peer, self.port);
        match self.protocol() {
            Protocol::Tcp => tcp::serve_connection(self, stream, peer).await,
            Protocol::Http => handler::serve_connection(self, stream, peer).await,
            Protocol::Smtp => smtp::serve_connection(self, stream, peer).await,
        }
    }

    /// Stop accepting, let in-flight requests finish within the grace period,
    /// then abandon whatever is left.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ImposterState::Stopping);
        if previous == ImposterState::Stopped {
            self.set_state(ImposterState::Stopped);
            return;
        }
        self.shutdown.cancel();

        let handle = self.serve_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Accept loop on port {} failed: {}", self.port, e);
            }
        }

        self.tasks.close();
        let grace = self.engine.config.shutdown_grace();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                "Imposter on port {} abandoning in-flight requests after {:?}",
                self.port, grace
            );
            self.abort.cancel();
            self.scripts.cancel();
            self.tasks.wait().await;
        }
        self.scripts.cancel();

        self.set_state(ImposterState::Stopped);
        if previous == ImposterState::Running {
            metrics::imposter_stopped(self.protocol().as_str());
        }
        info!("Imposter on port {} stopped", self.port);
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve one complete request: match, produce the reply, apply
    /// behaviors and record the exchange in the ledger.
    pub async fn resolve(self: &Arc<Self>, request: Request) -> Reply {
        let invocation = self.scripts.child();
        let matched = self.find_match(&request, &invocation).await;

        let (reply, stub_id, outcome) = match matched {
            None => {
                let reply = self.default_reply.clone();
                let outcome = Outcome::Default {
                    response: reply.to_json(self.mode()),
                };
                (reply, None, outcome)
            }
            Some(record) => {
                let response = record.next_response().clone();
                let (reply, outcome) = match &response.kind {
                    CompiledKind::Is(reply) => {
                        (reply.clone(), self.response_outcome(reply))
                    }
                    CompiledKind::Fault(fault) => (
                        Reply::Fault(*fault),
                        Outcome::Fault {
                            fault: fault.as_str().to_string(),
                        },
                    ),
                    CompiledKind::Inject(function) => {
                        self.resolve_injection(&record, function, &request, &invocation)
                            .await
                    }
                    CompiledKind::Proxy(proxy) => {
                        self.resolve_proxy(&record, proxy, &request).await
                    }
                };
                if matches!(outcome, Outcome::Response { .. } | Outcome::Fault { .. }) {
                    if let Some(wait) = &response.behaviors.wait {
                        self.wait(wait.duration()).await;
                    }
                }
                (reply, Some(record.id), outcome)
            }
        };

        metrics::record_request(self.port, self.protocol().as_str(), outcome_label(&outcome));
        self.ledger.append(LedgerEntry::new(request, stub_id, outcome));
        reply
    }

    /// Record a request that gets no reply (smtp).
    pub fn accept(&self, request: Request) {
        metrics::record_request(self.port, self.protocol().as_str(), "accepted");
        self.ledger
            .append(LedgerEntry::new(request, None, Outcome::Accepted));
    }

    fn response_outcome(&self, reply: &Reply) -> Outcome {
        Outcome::Response {
            response: reply.to_json(self.mode()),
        }
    }

    async fn find_match(
        self: &Arc<Self>,
        request: &Request,
        invocation: &InvocationContext,
    ) -> Option<Arc<StubRecord>> {
        if !self.injected_predicates {
            let ctx = EvalContext::new(request, self.engine.sandbox.as_ref(), invocation);
            return self.stubs.find_match(&ctx);
        }
        // injected predicates may run for a long time; keep them off the reactor
        let imposter = Arc::clone(self);
        let request = request.clone();
        let invocation = invocation.clone();
        let matching = tokio::task::spawn_blocking(move || {
            let ctx = EvalContext::new(&request, imposter.engine.sandbox.as_ref(), &invocation);
            imposter.stubs.find_match(&ctx)
        });
        match matching.await {
            Ok(matched) => matched,
            Err(e) => {
                error!("Predicate evaluation on port {} failed: {}", self.port, e);
                None
            }
        }
    }

    async fn resolve_injection(
        &self,
        record: &Arc<StubRecord>,
        function: &InjectedFunction,
        request: &Request,
        invocation: &InvocationContext,
    ) -> (Reply, Outcome) {
        let timeout = self.engine.config.injection_timeout();
        let state = Arc::clone(record.state());
        let sandbox = Arc::clone(&self.engine.sandbox);
        let request_json = request.to_json();
        let port = self.port;

        let run = async {
            // one injection per stub at a time, so state updates never interleave
            let _gate = state.gate.lock().await;
            let (completion, receiver) = Completion::channel(port);
            let function = function.clone();
            let values = state.values.clone();
            let ctx = invocation.clone();
            let evaluated = tokio::task::spawn_blocking(move || {
                sandbox.evaluate_response(&function, &request_json, &values, completion, &ctx)
            })
            .await
            .map_err(|e| InjectionError::Runtime {
                kind: InjectionKind::Response,
                message: e.to_string(),
            })??;
            match evaluated {
                Some(payload) => Ok::<_, InjectionError>(payload),
                None => receiver.await.map_err(|_| InjectionError::CompletionDropped),
            }
        };

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, run) => result,
            _ = self.abort.cancelled() => {
                invocation.cancel();
                return (Reply::Close, stopped_outcome());
            }
        };

        match result {
            Err(_) => {
                invocation.cancel();
                metrics::record_timeout(port, "inject");
                warn!(
                    "Response injection on port {} did not complete within {:?}",
                    port, timeout
                );
                (
                    Reply::Close,
                    Outcome::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    },
                )
            }
            Ok(Err(e)) => {
                metrics::record_injection(InjectionKind::Response.as_str(), false);
                warn!("Response injection on port {} failed: {}", port, e);
                self.failure(&e.to_string(), "invalid injection")
            }
            Ok(Ok(payload)) => match payload_to_reply(self.protocol(), self.mode(), &payload) {
                Ok(reply) => {
                    metrics::record_injection(InjectionKind::Response.as_str(), true);
                    let outcome = self.response_outcome(&reply);
                    (reply, outcome)
                }
                Err(message) => {
                    metrics::record_injection(InjectionKind::Response.as_str(), false);
                    let message = format!("injection returned an invalid response: {message}");
                    warn!("Response injection on port {}: {}", port, message);
                    self.failure(&message, "invalid injection")
                }
            },
        }
    }

    async fn resolve_proxy(
        &self,
        record: &Arc<StubRecord>,
        proxy: &ProxyResponse,
        request: &Request,
    ) -> (Reply, Outcome) {
        let protocol = self.protocol();
        let Some(upstream) = self.engine.upstream(protocol) else {
            return self.failure("protocol cannot be proxied", "invalid proxy");
        };
        let timeout = self.engine.config.proxy_timeout();
        let started = Instant::now();

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, upstream.forward(&proxy.to, request)) => result,
            _ = self.abort.cancelled() => return (Reply::Close, stopped_outcome()),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Err(_) => {
                metrics::record_timeout(self.port, "proxy");
                metrics::record_proxy_duration(protocol.as_str(), false, elapsed_ms);
                warn!(
                    "Proxy to {} from port {} did not answer within {:?}",
                    proxy.to, self.port, timeout
                );
                (
                    Reply::Close,
                    Outcome::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    },
                )
            }
            Ok(Err(e)) => {
                metrics::record_proxy_duration(protocol.as_str(), false, elapsed_ms);
                warn!("Proxy to {} from port {} failed: {}", proxy.to, self.port, e);
                self.failure(&e.to_string(), "invalid proxy")
            }
            Ok(Ok(upstream_reply)) => {
                metrics::record_proxy_duration(protocol.as_str(), true, elapsed_ms);
                if proxy.mode.records() {
                    let predicates = generate_predicates(&proxy.predicate_generators, request);
                    let latency = proxy
                        .add_wait_behavior
                        .then(|| upstream_reply.latency.as_millis() as u64);
                    let stub = recorded_stub(predicates, upstream_reply.payload, latency);
                    if let Err(e) =
                        self.stubs
                            .add_recorded(record.id, proxy.mode, stub, &self.compile_env())
                    {
                        warn!(
                            "Could not record proxied response on port {}: {}",
                            self.port, e
                        );
                    }
                }
                let outcome = self.response_outcome(&upstream_reply.reply);
                (upstream_reply.reply, outcome)
            }
        }
    }

    fn failure(&self, message: &str, code: &str) -> (Reply, Outcome) {
        (
            failure_reply(self.protocol(), code, message),
            Outcome::Error {
                message: message.to_string(),
            },
        )
    }

    async fn wait(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.abort.cancelled() => {}
        }
    }
}

fn stopped_outcome() -> Outcome {
    Outcome::Error {
        message: "imposter stopped before the request was resolved".to_string(),
    }
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Response { .. } => "response",
        Outcome::Default { .. } => "default",
        Outcome::Fault { .. } => "fault",
        Outcome::Error { .. } => "error",
        Outcome::Timeout { .. } => "timeout",
        Outcome::Accepted => "accepted",
    }
}
