//! Stub store: ordered, compiled stubs plus their per-stub bookkeeping.
//!
//! Matching runs against a snapshot of `Arc<StubRecord>`s so connection
//! handlers never hold the store lock while predicates execute. Recording a
//! proxied response replaces or inserts records under the write lock.

use super::response::{compile_response, CompiledResponse};
use super::types::{CompileEnv, ImposterError, Stub};
use crate::behaviors::StubCycler;
use crate::predicate::{all_match, compile_predicates, EvalContext, Predicate};
use crate::recording::ProxyMode;
use crate::scripting::CallState;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutable state shared by every invocation against one stub.
#[derive(Debug, Default)]
pub struct StubState {
    /// Serialises response injections against this stub
    pub(crate) gate: tokio::sync::Mutex<()>,
    pub values: CallState,
}

#[derive(Debug)]
pub struct StubRecord {
    pub id: u64,
    /// Declared form, kept for description
    pub stub: Stub,
    pub(crate) predicates: Vec<Predicate>,
    pub(crate) responses: Vec<CompiledResponse>,
    cycler: Arc<StubCycler>,
    state: Arc<StubState>,
}

impl StubRecord {
    fn compile(id: u64, stub: Stub, env: &CompileEnv<'_>) -> Result<Self, ImposterError> {
        let predicates = compile_predicates(&stub.predicates, env)?;
        let mut responses = stub
            .responses
            .iter()
            .map(|r| compile_response(r, env))
            .collect::<Result<Vec<_>, _>>()?;
        if responses.is_empty() {
            responses.push(CompiledResponse::empty(env.protocol, env.mode)?);
        }
        Ok(Self {
            id,
            stub,
            predicates,
            responses,
            cycler: Arc::new(StubCycler::new()),
            state: Arc::new(StubState::default()),
        })
    }

    /// Claim the response for this match, advancing the cycle.
    pub fn next_response(&self) -> &CompiledResponse {
        let index = self.cycler.next_index(&self.responses);
        // compile guarantees at least one response
        &self.responses[index.min(self.responses.len() - 1)]
    }

    pub fn state(&self) -> &Arc<StubState> {
        &self.state
    }

    /// Same stub with `other`'s responses appended; cycle position and call
    /// state carry over.
    fn with_appended(&self, other: StubRecord) -> StubRecord {
        let mut stub = self.stub.clone();
        stub.responses.extend(other.stub.responses);
        let mut responses = self.responses.clone();
        responses.extend(other.responses);
        StubRecord {
            id: self.id,
            stub,
            predicates: self.predicates.clone(),
            responses,
            cycler: Arc::clone(&self.cycler),
            state: Arc::clone(&self.state),
        }
    }
}

#[derive(Debug, Default)]
pub struct StubStore {
    stubs: RwLock<Vec<Arc<StubRecord>>>,
    next_id: AtomicU64,
}

impl StubStore {
    pub fn compile(stubs: &[Stub], env: &CompileEnv<'_>) -> Result<Self, ImposterError> {
        let store = StubStore::default();
        let records = stubs
            .iter()
            .cloned()
            .map(|stub| StubRecord::compile(store.allocate_id(), stub, env).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        *store.stubs.write() = records;
        Ok(store)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<Arc<StubRecord>> {
        self.stubs.read().clone()
    }

    /// Declared stubs in priority order, including recorded ones.
    pub fn declared(&self) -> Vec<Stub> {
        self.stubs.read().iter().map(|r| r.stub.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// First stub whose predicates all hold. A stub whose injected predicate
    /// fails is skipped.
    pub fn find_match(&self, ctx: &EvalContext<'_>) -> Option<Arc<StubRecord>> {
        for record in self.snapshot() {
            match all_match(&record.predicates, ctx) {
                Ok(true) => return Some(record),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        port = ctx.invocation.port,
                        stub_id = record.id,
                        "Skipping stub after predicate error: {}",
                        e
                    );
                }
            }
        }
        None
    }

    /// Store a stub recorded from a proxied round trip.
    ///
    /// proxyOnce inserts it in front of the proxy stub so it answers next
    /// time; proxyAlways appends its response to a later stub with the same
    /// predicates, or inserts it right after the proxy stub.
    pub fn add_recorded(
        &self,
        proxy_stub_id: u64,
        mode: ProxyMode,
        stub: Stub,
        env: &CompileEnv<'_>,
    ) -> Result<(), ImposterError> {
        if !mode.records() {
            return Ok(());
        }
        let record = StubRecord::compile(self.allocate_id(), stub, env)?;

        let mut stubs = self.stubs.write();
        let proxy_index = stubs
            .iter()
            .position(|s| s.id == proxy_stub_id)
            .unwrap_or(stubs.len());

        if mode == ProxyMode::ProxyAlways {
            let matching = stubs
                .iter()
                .enumerate()
                .skip(proxy_index + 1)
                .find(|(_, existing)| {
                    !existing.stub.predicates.is_empty()
                        && existing.stub.predicates == record.stub.predicates
                })
                .map(|(idx, _)| idx);

            if let Some(idx) = matching {
                let merged = stubs[idx].with_appended(record);
                debug!(
                    "Appended recorded response to stub {} ({} total responses)",
                    merged.id,
                    merged.responses.len()
                );
                stubs[idx] = Arc::new(merged);
                return Ok(());
            }

            let insert_index = (proxy_index + 1).min(stubs.len());
            stubs.insert(insert_index, Arc::new(record));
            debug!("Inserted recorded stub at index {} after proxy", insert_index);
        } else {
            stubs.insert(proxy_index, Arc::new(record));
            debug!("Inserted recorded stub at index {} before proxy", proxy_index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imposter::Protocol;
    use crate::message::{Mode, Request, TcpRequest};
    use crate::recording::recorded_stub;
    use crate::scripting::{InvocationContext, RhaiSandbox};
    use bytes::Bytes;
    use serde_json::json;

    fn env(sandbox: &RhaiSandbox) -> CompileEnv<'_> {
        CompileEnv {
            protocol: Protocol::Tcp,
            mode: Mode::Text,
            allow_injection: true,
            sandbox,
        }
    }

    fn stubs(value: serde_json::Value) -> Vec<Stub> {
        serde_json::from_value(value).unwrap()
    }

    fn matched(store: &StubStore, sandbox: &RhaiSandbox, data: &'static str) -> Option<u64> {
        let request = Request::Tcp(TcpRequest::new("a", Bytes::from_static(data.as_bytes()), Mode::Text));
        let invocation = InvocationContext::new(4545);
        store
            .find_match(&EvalContext::new(&request, sandbox, &invocation))
            .map(|r| r.id)
    }

    #[test]
    fn test_first_full_match_wins() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(
            &stubs(json!([
                {"predicates": [{"equals": {"data": "a"}}, {"equals": {"data": "b"}}]},
                {"predicates": [{"startsWith": {"data": "a"}}]},
                {"predicates": []}
            ])),
            &env(&sandbox),
        )
        .unwrap();
        assert_eq!(matched(&store, &sandbox, "abc"), Some(1));
        assert_eq!(matched(&store, &sandbox, "zzz"), Some(2));
    }

    #[test]
    fn test_failing_injected_predicate_skips_stub() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(
            &stubs(json!([
                {"predicates": [{"inject": "|request| { throw \"boom\"; }"}]},
                {"predicates": [{"equals": {"data": "x"}}]}
            ])),
            &env(&sandbox),
        )
        .unwrap();
        assert_eq!(matched(&store, &sandbox, "x"), Some(1));
        assert_eq!(matched(&store, &sandbox, "y"), None);
    }

    #[test]
    fn test_empty_responses_answer_with_empty_is() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(&stubs(json!([{}])), &env(&sandbox)).unwrap();
        let record = &store.snapshot()[0];
        assert_eq!(record.responses.len(), 1);
    }

    #[test]
    fn test_proxy_once_inserts_before_proxy() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(
            &stubs(json!([
                {"predicates": [{"equals": {"data": "first"}}]},
                {"responses": [{"proxy": {"to": "tcp://localhost:1"}}]}
            ])),
            &env(&sandbox),
        )
        .unwrap();
        let recorded = recorded_stub(vec![json!({"equals": {"data": "q"}})], json!({"data": "r"}), None);
        store
            .add_recorded(1, ProxyMode::ProxyOnce, recorded, &env(&sandbox))
            .unwrap();

        let ids: Vec<u64> = store.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 2, 1]);
        assert_eq!(matched(&store, &sandbox, "q"), Some(2));
    }

    #[test]
    fn test_proxy_always_appends_to_matching_stub() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(
            &stubs(json!([{"responses": [{"proxy": {"to": "tcp://localhost:1", "mode": "proxyAlways"}}]}])),
            &env(&sandbox),
        )
        .unwrap();
        let predicates = vec![json!({"equals": {"data": "q"}})];
        for reply in ["r1", "r2"] {
            let recorded = recorded_stub(predicates.clone(), json!({"data": reply}), None);
            store
                .add_recorded(0, ProxyMode::ProxyAlways, recorded, &env(&sandbox))
                .unwrap();
        }
        let other = recorded_stub(vec![json!({"equals": {"data": "z"}})], json!({"data": "z"}), None);
        store
            .add_recorded(0, ProxyMode::ProxyAlways, other, &env(&sandbox))
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].id, 0);
        // newest distinct predicates land right behind the proxy stub
        assert_eq!(snapshot[1].stub.predicates, vec![json!({"equals": {"data": "z"}})]);
        assert_eq!(snapshot[2].responses.len(), 2);
        assert_eq!(snapshot[2].stub.responses.len(), 2);
    }

    #[test]
    fn test_proxy_transparent_records_nothing() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(&stubs(json!([{}])), &env(&sandbox)).unwrap();
        let recorded = recorded_stub(vec![], json!({"data": "r"}), None);
        store
            .add_recorded(0, ProxyMode::ProxyTransparent, recorded, &env(&sandbox))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_appended_record_keeps_cycle_and_state() {
        let sandbox = RhaiSandbox::new(100_000);
        let store = StubStore::compile(
            &stubs(json!([
                {"responses": [{"proxy": {"to": "tcp://localhost:1", "mode": "proxyAlways"}}]},
                {"predicates": [{"equals": {"data": "q"}}], "responses": [{"is": {"data": "1"}}, {"is": {"data": "2"}}]}
            ])),
            &env(&sandbox),
        )
        .unwrap();
        let before = Arc::clone(&store.snapshot()[1]);
        let _ = before.next_response();
        before.state().values.clone().set("k".into(), rhai::Dynamic::from(1_i64));

        let recorded = recorded_stub(vec![json!({"equals": {"data": "q"}})], json!({"data": "3"}), None);
        store
            .add_recorded(0, ProxyMode::ProxyAlways, recorded, &env(&sandbox))
            .unwrap();

        let after = Arc::clone(&store.snapshot()[1]);
        assert_eq!(after.id, before.id);
        assert_eq!(after.responses.len(), 3);
        assert!(Arc::ptr_eq(after.state(), before.state()));
        assert!(after.state().values.clone().contains("k".into()));
    }
}
