use super::InjectionKind;
use rhai::Dynamic;
use tracing::{debug, error, info, warn};

/// `logger` handle passed to injected functions.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLogger {
    port: u16,
    kind: InjectionKind,
}

impl ScriptLogger {
    pub fn new(port: u16, kind: InjectionKind) -> Self {
        Self { port, kind }
    }

    pub fn debug(&mut self, message: Dynamic) {
        debug!(port = self.port, injection = self.kind.as_str(), "{message}");
    }

    pub fn info(&mut self, message: Dynamic) {
        info!(port = self.port, injection = self.kind.as_str(), "{message}");
    }

    pub fn warn(&mut self, message: Dynamic) {
        warn!(port = self.port, injection = self.kind.as_str(), "{message}");
    }

    pub fn error(&mut self, message: Dynamic) {
        error!(port = self.port, injection = self.kind.as_str(), "{message}");
    }

    pub(super) fn register(engine: &mut rhai::Engine) {
        engine
            .register_type_with_name::<ScriptLogger>("Logger")
            .register_fn("debug", ScriptLogger::debug)
            .register_fn("info", ScriptLogger::info)
            .register_fn("warn", ScriptLogger::warn)
            .register_fn("error", ScriptLogger::error);
    }
}
