//! Where VMM output and lifecycle events go.
//!
//! The executor never ships logs itself; it hands lines and events to a
//! [`TelemetrySink`]. [`TracingSink`] forwards to `tracing`, and
//! [`MemorySink`] keeps everything in memory for tests and debugging.

use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Which pipe a VMM output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Milestones in a sandbox's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    CreateFailed { reason: String },
    StopRequested,
    LifetimeExceeded,
    Exited,
    CleanedUp { failed_steps: usize },
    ClockSynced { attempts: u32 },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::CreateFailed { reason } => write!(f, "create failed: {reason}"),
            Self::StopRequested => f.write_str("stop requested"),
            Self::LifetimeExceeded => f.write_str("maximum instance length exceeded"),
            Self::Exited => f.write_str("exited"),
            Self::CleanedUp { failed_steps } => {
                write!(f, "cleaned up ({failed_steps} failed steps)")
            }
            Self::ClockSynced { attempts } => write!(f, "clock synced after {attempts} attempts"),
        }
    }
}

/// Receives VMM output and lifecycle events. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn vmm_output(&self, sandbox_id: &str, stream: LogStream, line: &str);

    fn lifecycle(&self, sandbox_id: &str, event: &LifecycleEvent);
}

/// Forwards everything to `tracing` under the `ember::vmm` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn vmm_output(&self, sandbox_id: &str, stream: LogStream, line: &str) {
        match stream {
            LogStream::Stdout => {
                tracing::info!(target: "ember::vmm", sandbox_id, %stream, "{line}");
            }
            LogStream::Stderr => {
                tracing::warn!(target: "ember::vmm", sandbox_id, %stream, "{line}");
            }
        }
    }

    fn lifecycle(&self, sandbox_id: &str, event: &LifecycleEvent) {
        tracing::info!(target: "ember::vmm", sandbox_id, %event, "sandbox lifecycle");
    }
}

/// Records everything it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    output: Mutex<Vec<(String, LogStream, String)>>,
    events: Mutex<Vec<(String, LifecycleEvent)>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Output lines recorded for `sandbox_id` on `stream`, in arrival order.
    #[must_use]
    pub fn lines(&self, sandbox_id: &str, stream: LogStream) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, s, _)| id == sandbox_id && *s == stream)
            .map(|(_, _, line)| line.clone())
            .collect()
    }

    /// Lifecycle events recorded for `sandbox_id`, in order.
    #[must_use]
    pub fn events(&self, sandbox_id: &str) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| id == sandbox_id)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn vmm_output(&self, sandbox_id: &str, stream: LogStream, line: &str) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sandbox_id.to_owned(), stream, line.to_owned()));
    }

    fn lifecycle(&self, sandbox_id: &str, event: &LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sandbox_id.to_owned(), event.clone()));
    }
}
