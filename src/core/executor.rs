//! Execution boundary shared by tasklet dispatchers and queue workers.
//!
//! Handlers return [`AppResult`]; an `Err` or a panic is turned into a
//! per-task error string here so that one failing handler cannot take down
//! the thread that runs it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::AppResult;

/// Run a handler, converting errors and panics into an error description.
pub(crate) fn execute_guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> AppResult<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
