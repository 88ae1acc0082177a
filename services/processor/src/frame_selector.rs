use crate::job::Detection;
use serde::Deserialize;
use tracing::debug;

/// Policy for turning the event set into the frames that are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Keep exactly one representative frame whenever anything was classified
    #[default]
    SingleBest,
    /// Keep every event frame, but only when there are at least two of them
    MultiOrNothing,
}

/// Everything the selector needs besides the detections themselves
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    pub target_label: String,
    /// Inclusive lower bound on confidence
    pub confidence_threshold: f32,
    pub strategy: SelectionStrategy,
}

impl SelectionPolicy {
    fn is_event(&self, detection: &Detection) -> bool {
        detection.label.eq_ignore_ascii_case(&self.target_label)
            && detection.confidence >= self.confidence_threshold
    }
}

/// Outcome of selection, by frame index. Both lists are in ascending index order
/// and together cover every classified frame exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionResult {
    pub retained: Vec<u64>,
    pub rejected: Vec<u64>,
}

impl SelectionResult {
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}

/// Decide which classified frames to keep.
///
/// Pure and deterministic: the result depends only on the set of detections
/// and the policy, not on the order they are passed in.
pub fn select(detections: &[Detection], policy: &SelectionPolicy) -> SelectionResult {
    let mut ordered: Vec<&Detection> = detections.iter().collect();
    ordered.sort_by_key(|d| d.frame_index);

    let events: Vec<&Detection> = ordered.iter().copied().filter(|d| policy.is_event(d)).collect();

    let retained: Vec<u64> = match policy.strategy {
        SelectionStrategy::SingleBest => {
            let pool = if events.is_empty() { &ordered } else { &events };
            best_of(pool).map(|d| d.frame_index).into_iter().collect()
        }
        SelectionStrategy::MultiOrNothing => {
            if events.len() >= 2 {
                events.iter().map(|d| d.frame_index).collect()
            } else {
                Vec::new()
            }
        }
    };

    let rejected = ordered
        .iter()
        .map(|d| d.frame_index)
        .filter(|index| !retained.contains(index))
        .collect();

    debug!(
        strategy = ?policy.strategy,
        classified = ordered.len(),
        events = events.len(),
        retained = retained.len(),
        "Selection complete"
    );

    SelectionResult { retained, rejected }
}

/// Highest confidence; ties go to the lowest frame index. Input must be index-ordered.
fn best_of<'a>(pool: &[&'a Detection]) -> Option<&'a Detection> {
    pool.iter().copied().fold(None, |best, candidate| match best {
        Some(b) if b.confidence >= candidate.confidence => Some(b),
        _ => Some(candidate),
    })
}
