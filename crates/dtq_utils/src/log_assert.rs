/// Perform a runtime assertion, but if it fails, log an error rather than
/// issuing a runtime panic.
///
/// Debug builds still panic, so that broken invariants surface in tests.
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let check: bool = $check;
        debug_assert!(check);
        if !check {
            tracing::error!($($field)*)
        }
    }}
}

/// Marks a state the caller believes to be unreachable.
#[macro_export]
macro_rules! illegal_state {
    ($msg:expr, $($field:tt)*) => {{
        debug_assert!(false, "illegal state: {}", $msg);
        tracing::error!($($field)*, "illegal state: {}", $msg)
    }}
}
