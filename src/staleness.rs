use crate::checkpoint::CheckpointSnapshot;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of comparing a checkpoint's age against the stale threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    /// Elapsed time since the last checkpoint update.
    Stale(Duration),
    /// No checkpoint, or no usable timestamp. Never treated as stale.
    NoSignal,
}

/// Classify a checkpoint as fresh, stale (strictly older than `threshold`) or
/// signal-less.
pub fn evaluate(
    snapshot: Option<&CheckpointSnapshot>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Staleness {
    let Some(last_update) = snapshot.and_then(|s| s.last_update) else {
        return Staleness::NoSignal;
    };

    // A timestamp in the future (clock skew) counts as fresh.
    let Ok(elapsed) = (now - last_update).to_std() else {
        return Staleness::Fresh;
    };

    if elapsed > threshold {
        Staleness::Stale(elapsed)
    } else {
        Staleness::Fresh
    }
}
