use std::{any::Any, panic::UnwindSafe};

use anyhow::{anyhow, Result};

/// Turns a panic payload into a readable message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic!()"
    };
    format!("panic: {msg}")
}

/// Runs `f`, converting a panic inside it into an error.
pub fn catch_unwind<F: FnOnce() -> Result<R> + UnwindSafe, R>(f: F) -> Result<R> {
    std::panic::catch_unwind(f).unwrap_or_else(|payload| Err(anyhow!(panic_message(&*payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_becomes_error() {
        let r: Result<()> = catch_unwind(|| panic!("boom {}", 42));
        let msg = r.unwrap_err().to_string();
        assert_eq!(msg, "panic: boom 42");
        assert_eq!(catch_unwind(|| Ok(7)).unwrap(), 7);
    }
}
