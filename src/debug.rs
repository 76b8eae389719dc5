//! Debug message routing.
//!
//! Every device owns a [`DebugCallback`]. The executors use it to report commands a backend
//! cannot perform, and the native layer uses it to report failed driver calls together with
//! their call site. The default callback forwards everything to [`tracing`].

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMessageType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMessageSource {
    /// Messages produced by this crate.
    Layer,
    /// Messages produced while talking to the native driver.
    Driver,
    /// Messages injected by the application.
    Application,
}

pub trait DebugCallback: Send + Sync {
    fn handle_message(&self, ty: DebugMessageType, source: DebugMessageSource, message: &str);
}

/// Forwards debug messages to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDebugCallback;

impl DebugCallback for TracingDebugCallback {
    fn handle_message(&self, ty: DebugMessageType, source: DebugMessageSource, message: &str) {
        match ty {
            DebugMessageType::Info => tracing::info!(?source, "{message}"),
            DebugMessageType::Warning => tracing::warn!(?source, "{message}"),
            DebugMessageType::Error => tracing::error!(?source, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub ty: DebugMessageType,
    pub source: DebugMessageSource,
    pub message: String,
}

/// Collects every message it receives.
///
/// ```
/// use scoria::debug::{DebugCallback, DebugMessageLog, DebugMessageSource, DebugMessageType};
///
/// let log = DebugMessageLog::default();
/// log.handle_message(DebugMessageType::Warning, DebugMessageSource::Layer, "hello");
/// assert_eq!(log.warnings(), vec!["hello".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct DebugMessageLog {
    messages: Mutex<Vec<DebugMessage>>,
}

impl DebugMessageLog {
    pub fn messages(&self) -> Vec<DebugMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.ty == DebugMessageType::Warning)
            .map(|m| m.message)
            .collect()
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl DebugCallback for DebugMessageLog {
    fn handle_message(&self, ty: DebugMessageType, source: DebugMessageSource, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(DebugMessage {
                ty,
                source,
                message: message.to_string(),
            });
    }
}
