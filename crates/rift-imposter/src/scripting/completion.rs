//! One-shot completion callback for asynchronous response injections.

use parking_lot::Mutex;
use rhai::{Dynamic, FnPtr};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

pub type CompletionReceiver = oneshot::Receiver<Value>;

/// Sending half handed to the script as `callback`.
///
/// The first call delivers the response; later calls are ignored. When every
/// handle is dropped without a call the receiver observes a closed channel.
#[derive(Clone)]
pub struct Completion {
    sender: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
    port: u16,
}

impl Completion {
    pub fn channel(port: u16) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
                port,
            },
            rx,
        )
    }

    /// Deliver the response. Returns false if it was already delivered.
    pub fn complete(&self, value: Value) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // receiver gone means the caller timed out; nothing left to do
                let _ = tx.send(value);
                true
            }
            None => {
                warn!(
                    port = self.port,
                    "Injection completion callback called more than once; ignoring"
                );
                false
            }
        }
    }

    /// Wrap as a script-callable function pointer: `callback.call(response)`.
    pub(super) fn into_fn_ptr(self) -> Result<FnPtr, Box<rhai::EvalAltResult>> {
        let mut fn_ptr = FnPtr::new(COMPLETE_FN)?;
        fn_ptr.add_curry(Dynamic::from(self));
        Ok(fn_ptr)
    }

    pub(super) fn register(engine: &mut rhai::Engine) {
        engine
            .register_type_with_name::<Completion>("Completion")
            .register_fn(COMPLETE_FN, |completion: &mut Completion, value: Dynamic| {
                completion.complete(super::rhai_engine::dynamic_to_json(value));
            });
    }
}

const COMPLETE_FN: &str = "complete_injection";
