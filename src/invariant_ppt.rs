//! Invariant PPT Testing Framework
//!
//! Runtime invariant checking plus contract-test support. Production code
//! asserts the structural invariants of the pairing subsystem (one channel per
//! endpoint, one camera handle per controller, well-formed frames); tests then
//! check that the paths they exercised actually went through those assertions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chartlink::invariant_ppt::*;
//!
//! assert_invariant!(
//!     core.channel.is_none(),
//!     "Endpoint holds at most one channel",
//!     "endpoint::install_channel"
//! );
//!
//! #[test]
//! fn contract_endpoint() {
//!     contract_test("endpoint", &["Endpoint holds at most one channel"]);
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::thread_local;

/// Invariant messages used across the crate, so tests can name them without
/// retyping the strings.
pub mod names {
    pub const SINGLE_CHANNEL: &str = "Endpoint holds at most one channel";
    pub const TERMINAL_STATE: &str = "Superseded work only resumes on a terminal endpoint";
    pub const SINGLE_CAMERA_HANDLE: &str = "Capture controller holds at most one camera handle";
    pub const FRAME_LENGTH: &str = "Frame length prefix matches payload";
}

thread_local! {
    static INVARIANT_LOG: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Assert an invariant and log it for contract testing.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, Some($context))
    };
}

/// Internal implementation - do not call directly
#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    INVARIANT_LOG.with(|log| {
        log.borrow_mut().insert(message.to_string());
    });

    if !condition {
        let ctx = context.unwrap_or("unknown");
        panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
    }
}

/// Check that specific invariants were verified on this thread.
///
/// # Panics
/// Panics if any required invariant was not checked.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let log = INVARIANT_LOG.with(|log| log.borrow().clone());

    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|invariant| !log.contains(*invariant))
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: The following invariants were not checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

/// Clear the invariant log
pub fn clear_invariant_log() {
    INVARIANT_LOG.with(|log| {
        log.borrow_mut().clear();
    });
}
