//! Panic payload helpers shared by the pool, dispatcher, and task runner.

use std::any::Any;

/// Extracts a printable message from a caught panic payload.
pub(crate) fn message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_str_payload() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("boom"))).unwrap_err();
        assert_eq!(message(&*payload), "boom");
    }

    #[test]
    fn test_string_payload() {
        let value = 7;
        let payload =
            catch_unwind(AssertUnwindSafe(|| panic!("code {value}"))).unwrap_err();
        assert_eq!(message(&*payload), "code 7");
    }
}
