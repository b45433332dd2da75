//! Environment signals: input and lifecycle observations from the host.
//!
//! The collector never listens to a UI toolkit directly. A host wires its
//! own observers into a [`SignalSource`]; [`ManualSignals`] is the plain
//! implementation where the host pushes signals by hand.

use std::sync::Mutex;

use effm_core::Metadata;
use tokio::sync::mpsc;

/// One observation from the host environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Pointer click on an element
    Click {
        /// Element selector
        element: String,
        /// Pointer x
        x: f64,
        /// Pointer y
        y: f64,
    },
    /// Key press
    KeyDown {
        /// Key name
        key: String,
        /// Focused element selector
        element: String,
        /// Held modifiers (`ctrl`, `shift`, `alt`, `meta`)
        modifiers: Vec<String>,
    },
    /// Scroll within an element
    Scroll {
        /// Element selector
        element: String,
    },
    /// Pointer movement
    PointerMove {
        /// Pointer x
        x: f64,
        /// Pointer y
        y: f64,
    },
    /// The work surface became hidden or visible
    VisibilityChanged {
        /// New visibility
        visible: bool,
    },
    /// The host is about to exit
    Unload,
    /// Uncaught runtime error in the host
    RuntimeError {
        /// Error message
        message: String,
        /// Stack trace
        stack: Option<String>,
        /// Location and other details
        context: Metadata,
    },
}

/// Sending half handed to a source while the collector is running.
#[derive(Debug, Clone)]
pub struct SignalSink(mpsc::UnboundedSender<Signal>);

impl SignalSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Forward a signal. Returns false if the collector has stopped.
    pub fn emit(&self, signal: Signal) -> bool {
        self.0.send(signal).is_ok()
    }
}

/// Something that observes the environment and reports [`Signal`]s.
pub trait SignalSource: Send + Sync {
    /// Begin reporting into `sink`.
    fn start(&self, sink: SignalSink);

    /// Stop reporting. Idempotent.
    fn stop(&self);
}

/// A source the host drives by calling [`ManualSignals::emit`].
#[derive(Debug, Default)]
pub struct ManualSignals {
    sink: Mutex<Option<SignalSink>>,
}

impl ManualSignals {
    /// Create an idle source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a signal. Dropped (returns false) while not started.
    pub fn emit(&self, signal: Signal) -> bool {
        match &*self.sink.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(sink) => sink.emit(signal),
            None => false,
        }
    }

    /// Whether a collector is attached.
    pub fn is_attached(&self) -> bool {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl SignalSource for ManualSignals {
    fn start(&self, sink: SignalSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    fn stop(&self) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
