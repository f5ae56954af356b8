//! Invariant checks with contract tracking.
//!
//! Every check records its id so contract tests can prove a code path
//! actually enforced it. A violated check never lets the caller continue
//! with a corrupted model: it logs and returns [`McError::Unexpected`], or
//! panics when the `fail-fast` feature is enabled.

use crate::error::{McError, Result};
#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

pub const RDM_KIND_PRESERVED: u32 = 1;
pub const RDM_FREE_VALID: u32 = 2;
pub const EPOCH_NO_OVERLAP: u32 = 3;
pub const BLOCK_SINGLE_OWNER: u32 = 4;
pub const CHAIN_LINKED: u32 = 5;
pub const ECMP_MEMBER_LOCATED: u32 = 6;
pub const VERSION_SWITCH_ORDER: u32 = 7;
pub const TAIL_DEFERRED: u32 = 8;
pub const PLACEMENT_CLEARED: u32 = 9;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

/// Maps an invariant id to its name (diagnostics only).
pub const fn invariant_name(id: u32) -> &'static str {
    match id {
        RDM_KIND_PRESERVED => "RDM_KIND_PRESERVED",
        RDM_FREE_VALID => "RDM_FREE_VALID",
        EPOCH_NO_OVERLAP => "EPOCH_NO_OVERLAP",
        BLOCK_SINGLE_OWNER => "BLOCK_SINGLE_OWNER",
        CHAIN_LINKED => "CHAIN_LINKED",
        ECMP_MEMBER_LOCATED => "ECMP_MEMBER_LOCATED",
        VERSION_SWITCH_ORDER => "VERSION_SWITCH_ORDER",
        TAIL_DEFERRED => "TAIL_DEFERRED",
        PLACEMENT_CLEARED => "PLACEMENT_CLEARED",
        _ => "UNKNOWN",
    }
}

/// Check an invariant, recording that it was asserted.
pub(crate) fn check_invariant(
    id: u32,
    condition: bool,
    message: &str,
    context: Option<&str>,
) -> Result<()> {
    #[cfg(feature = "ppt")]
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.insert(id);
    }
    if condition {
        return Ok(());
    }
    let full_message = match context {
        Some(ctx) => format!(
            "invariant {} failed: {} (context: {})",
            invariant_name(id),
            message,
            ctx
        ),
        None => format!("invariant {} failed: {}", invariant_name(id), message),
    };
    log::error!("{}", full_message);
    if cfg!(feature = "fail-fast") {
        panic!("{}", full_message);
    }
    Err(McError::Unexpected(full_message))
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<&str> = {
        let log = INVARIANT_LOG.lock().unwrap_or_else(|e| e.into_inner());
        required_invariants
            .iter()
            .filter(|id| !log.contains(id))
            .map(|&id| invariant_name(id))
            .collect()
    };
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_check_is_ok() {
        assert!(check_invariant(CHAIN_LINKED, 1 + 1 == 2, "math works", Some("basic")).is_ok());
    }

    #[cfg(not(feature = "fail-fast"))]
    #[test]
    fn failing_check_is_unexpected() {
        let err = check_invariant(RDM_FREE_VALID, false, "double free", None).unwrap_err();
        match err {
            McError::Unexpected(msg) => assert!(msg.contains("RDM_FREE_VALID")),
            other => panic!("wrong error {:?}", other),
        }
    }

    #[cfg(feature = "ppt")]
    #[test]
    fn contract_sees_recorded_ids() {
        check_invariant(TAIL_DEFERRED, true, "recorded", None).unwrap();
        contract_test("recorded", &[TAIL_DEFERRED]);
    }

    #[test]
    fn names_map() {
        assert_eq!(invariant_name(EPOCH_NO_OVERLAP), "EPOCH_NO_OVERLAP");
        assert_eq!(invariant_name(999), "UNKNOWN");
    }
}
