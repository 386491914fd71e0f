//! Continuation controller configuration (C8).

use serde::Deserialize;

/// Bounds on the streaming continuation loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuationConfig {
    /// Maximum number of resume attempts per client request. A handful of
    /// truncated upstream replies in a row is a legitimate long answer; much
    /// beyond that it is almost always a model stuck restating the same
    /// prefix, so this stays conservative rather than looping indefinitely.
    pub max_continuation_attempts: u32,
    /// Minimum number of emitted characters required before a continuation
    /// attempt is issued; below this, the controller aborts instead of looping.
    pub min_resume_text_length: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_continuation_attempts: 3,
            min_resume_text_length: 10,
        }
    }
}
