//! Stable exit codes for stepflow CLI commands.

use crate::approval::RevisionBudgetExhausted;
use crate::core::cancel::is_cancelled;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid workspace, config, or checkpoint, or any other error.
pub const INVALID: i32 = 1;
/// Plan or variables were not approved within their revision budget.
pub const NOT_APPROVED: i32 = 2;
/// The run was cancelled.
pub const CANCELLED: i32 = 3;

/// Exit code for a command that failed with `err`.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if is_cancelled(err) {
        CANCELLED
    } else if err.is::<RevisionBudgetExhausted>() {
        NOT_APPROVED
    } else {
        INVALID
    }
}
