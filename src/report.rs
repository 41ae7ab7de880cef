/// Validation of the sandbox's voluntary status self-report
use crate::response::{ResponseBuffer, RESPONSE_CAPACITY};
use crate::types::{Result, RESERVED_STATUS_PREFIX, STATUS_STATUS_INVALID};
use serde_json::Value;

/// Judge the accumulated self-report and settle the committed verdict.
///
/// The pending bytes are copied into the committed buffer first and only
/// then validated; on accept the verdict is therefore the report verbatim.
/// A report is rejected when it is empty, longer than the response
/// capacity, not a single JSON object, or tries to claim a `status` that
/// is not a string or sits in the reserved `sys.` namespace. Rejection
/// replaces the committed buffer with the fixed invalid-status verdict.
///
/// Returns whether the report was accepted.
pub fn settle_report(pending: &ResponseBuffer, committed: &mut ResponseBuffer) -> Result<bool> {
    committed.copy_from(pending);
    if pending.size() == 0 || pending.size() > RESPONSE_CAPACITY || !is_valid(pending.as_bytes()) {
        committed.set_status(STATUS_STATUS_INVALID)?;
        return Ok(false);
    }
    Ok(true)
}

fn is_valid(raw: &[u8]) -> bool {
    let root: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let object = match root.as_object() {
        Some(object) => object,
        None => return false,
    };
    match object.get("status") {
        None => true,
        Some(Value::String(status)) => !status.starts_with(RESERVED_STATUS_PREFIX),
        Some(_) => false,
    }
}
