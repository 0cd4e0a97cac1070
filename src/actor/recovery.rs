//! Panic recovery at the dispatch boundary.
//!
//! Handler panics must never unwind through the event loop; they are caught
//! here and turned into errors the actor can reply with.

use crate::types::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted
/// to [`Error::Panicked`].
///
/// # Example
/// ```
/// use pulsar_core::actor::with_recovery;
///
/// let result = with_recovery(|| Ok(2 + 2), "add");
/// assert_eq!(result.unwrap(), 4);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );
            Err(Error::Panicked {
                operation: operation_name.to_string(),
                message: panic_msg,
            })
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
