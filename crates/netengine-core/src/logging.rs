//! Caller-installed logger record.
//!
//! A fresh context carries an empty placeholder. Callers that want engine
//! log lines routed somewhere other than `tracing` install a sink, plus an
//! optional cleanup callback that receives the opaque context and arguments
//! when the engine context is destroyed.

use std::any::Any;
use std::fmt;

use tracing::Level;

/// Receives engine log lines.
pub type LogSink = Box<dyn Fn(Level, &str)>;

/// Called once at teardown with the logger's opaque context and arguments.
pub type LoggerCleanup = Box<dyn FnOnce(Option<Box<dyn Any>>, Option<Box<dyn Any>>)>;

/// Logger record owned by an engine context.
#[derive(Default)]
pub struct EngineLogger {
    context: Option<Box<dyn Any>>,
    args: Option<Box<dyn Any>>,
    sink: Option<LogSink>,
    cleanup: Option<LoggerCleanup>,
}

impl EngineLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Any) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    pub fn with_args(mut self, args: impl Any) -> Self {
        self.args = Some(Box::new(args));
        self
    }

    pub fn with_sink(mut self, sink: impl Fn(Level, &str) + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn on_cleanup(
        mut self,
        cleanup: impl FnOnce(Option<Box<dyn Any>>, Option<Box<dyn Any>>) + 'static,
    ) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// True for the zeroed record a new context starts with.
    pub fn is_placeholder(&self) -> bool {
        self.context.is_none() && self.args.is_none() && self.sink.is_none() && self.cleanup.is_none()
    }

    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    /// Route one line to the sink, or to `tracing` when none is installed.
    pub fn log(&self, level: Level, message: &str) {
        if let Some(sink) = &self.sink {
            sink(level, message);
            return;
        }
        match level {
            Level::ERROR => tracing::error!(target: "netengine", "{message}"),
            Level::WARN => tracing::warn!(target: "netengine", "{message}"),
            Level::INFO => tracing::info!(target: "netengine", "{message}"),
            Level::DEBUG => tracing::debug!(target: "netengine", "{message}"),
            Level::TRACE => tracing::trace!(target: "netengine", "{message}"),
        }
    }

    /// Run the cleanup callback, if any. Returns whether one ran.
    pub(crate) fn cleanup(self) -> bool {
        match self.cleanup {
            Some(cleanup) => {
                cleanup(self.context, self.args);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for EngineLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLogger")
            .field("context", &self.context.is_some())
            .field("args", &self.args.is_some())
            .field("sink", &self.sink.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}
