//! Fault-tolerant wrapper around a [`FrameTransform`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::FrameTransform;
use crate::data::Frame;
use crate::{Error, Result};

/// Default per-frame deadline for the transform collaborator
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_millis(1000);

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    /// Frames submitted to `apply`
    pub applied: u64,
    /// Frames for which the passthrough fallback was used
    pub failures: u64,
}

/// Invokes the transform collaborator once per frame
///
/// On error, panic or timeout the input frame is returned unchanged and the
/// failure counter is incremented. A timed-out invocation keeps running on
/// the blocking pool and its result is discarded. At most one invocation
/// runs at a time: frames arriving while it is still busy are passed through
/// and counted as failures.
pub struct TransformStage {
    transform: Arc<dyn FrameTransform>,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
    applied: AtomicU64,
    failures: AtomicU64,
}

impl TransformStage {
    /// Wrap a transform with the default deadline
    pub fn new(transform: Arc<dyn FrameTransform>) -> Self {
        Self::with_timeout(transform, DEFAULT_TRANSFORM_TIMEOUT)
    }

    /// Wrap a transform with an explicit deadline
    pub fn with_timeout(transform: Arc<dyn FrameTransform>, timeout: Duration) -> Self {
        Self {
            transform,
            timeout,
            in_flight: Arc::new(Semaphore::new(1)),
            applied: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Name of the wrapped transform
    pub fn name(&self) -> &str {
        self.transform.name()
    }

    /// Per-frame deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transform `frame`, falling back to the input on any failure
    pub async fn apply(&self, frame: Frame) -> Frame {
        self.applied.fetch_add(1, Ordering::Relaxed);

        match self.try_apply(&frame).await {
            Ok(output) => output,
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    transform = %self.transform.name(),
                    pts = frame.pts(),
                    failures,
                    "Transform failed, passing frame through: {}",
                    e
                );
                frame
            }
        }
    }

    /// Run the collaborator under the deadline, surfacing its failure
    pub async fn try_apply(&self, frame: &Frame) -> Result<Frame> {
        // Held by the blocking closure, so a timed-out call still occupies the slot
        let permit = Arc::clone(&self.in_flight).try_acquire_owned().map_err(|_| {
            Error::TransformBusy(format!(
                "{} is still processing an earlier frame",
                self.transform.name()
            ))
        })?;

        let transform = Arc::clone(&self.transform);
        let input = frame.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            transform.transform(&input)
        });

        let joined = tokio::time::timeout(self.timeout, handle)
            .await
            .map_err(|_| Error::TransformTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?;

        match joined {
            Ok(Ok(output)) => {
                debug!(transform = %self.transform.name(), pts = output.pts(), "Frame transformed");
                Ok(output)
            }
            Ok(Err(e)) if e.is_transform_error() => Err(e),
            Ok(Err(e)) => Err(Error::TransformFailed(e.to_string())),
            Err(join_err) if join_err.is_panic() => {
                Err(Error::TransformPanicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(Error::TransformFailed(join_err.to_string())),
        }
    }

    /// Number of frames that fell back to passthrough
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Snapshot of the stage counters
    pub fn stats(&self) -> TransformStats {
        TransformStats {
            applied: self.applied.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TransformStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStage")
            .field("transform", &self.transform.name())
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
