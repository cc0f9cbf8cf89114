//! Signal handling: SIGTERM/SIGINT cancel the shared [`CancelToken`] so every
//! limiter wakes from its current sleep, resumes what it stopped and returns.
//!
//! Uses `signal-hook` for registration. A small `pdl-signals` thread forwards
//! delivered signals; nothing runs inside the async-signal context.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use crate::core::errors::{PdlError, Result};
use crate::daemon::clock::CancelToken;

// ──────────────────── signal handler ────────────────────

/// Bridges process signals to a [`CancelToken`].
pub struct SignalHandler {
    cancel: CancelToken,
    last_signal: Arc<AtomicI32>,
    handle: Handle,
    forwarder: Option<thread::JoinHandle<()>>,
}

impl SignalHandler {
    /// Register SIGTERM/SIGINT and start the forwarding thread.
    pub fn install(cancel: CancelToken) -> Result<Self> {
        let mut signals = Signals::new([SIGTERM, SIGINT]).map_err(|e| PdlError::Runtime {
            details: format!("failed to register SIGTERM/SIGINT: {e}"),
        })?;
        let handle = signals.handle();
        let last_signal = Arc::new(AtomicI32::new(0));

        let token = cancel.clone();
        let last = Arc::clone(&last_signal);
        let forwarder = thread::Builder::new()
            .name("pdl-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    last.store(signal, Ordering::Relaxed);
                    let name = signal_name(signal);
                    if token.is_cancelled() {
                        eprintln!("[PDL-SIGNAL] {name} received again, still shutting down");
                    } else {
                        eprintln!("[PDL-SIGNAL] {name} received, shutting down");
                        token.cancel();
                    }
                }
            })
            .map_err(|e| PdlError::Runtime {
                details: format!("failed to spawn signal thread: {e}"),
            })?;

        Ok(Self {
            cancel,
            last_signal,
            handle,
            forwarder: Some(forwarder),
        })
    }

    /// Whether a shutdown has been requested by a signal or programmatically.
    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Programmatically request shutdown.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Most recent signal number delivered, if any.
    #[must_use]
    pub fn last_signal(&self) -> Option<i32> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            signal => Some(signal),
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
    }
}

#[must_use]
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGTERM => "SIGTERM",
        SIGINT => "SIGINT",
        _ => "signal",
    }
}

// ──────────────────── tests ────────────────────
