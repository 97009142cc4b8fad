//! Campaign phase graph
//!
//! VALIDATING is the only phase that may go straight to FAILED. Every other
//! failure routes through cleanup and ends in REPORTING.

use crate::error::SortieError;
use crate::types::Phase;

/// Validates a phase transition.
///
/// Illegal transitions are returned as errors; with the `strict-debug`
/// feature they panic instead.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), SortieError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal phase transition attempted: {from} -> {to}");

        #[cfg(not(feature = "strict-debug"))]
        Err(SortieError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Validating => vec![Selecting, Failed],
        Selecting => vec![Provisioning, VerifyingCleanup],
        Provisioning => vec![Monitoring, VerifyingCleanup],
        Monitoring => vec![VerifyingCleanup],
        VerifyingCleanup => vec![ForcingCleanup],
        ForcingCleanup => vec![Reporting],
        Reporting => vec![Completed, Failed],
        Completed => vec![],
        Failed => vec![],
    }
}

fn allowed(from: Phase, to: Phase) -> bool {
    allowed_transitions(from).into_iter().any(|p| p == to)
}
