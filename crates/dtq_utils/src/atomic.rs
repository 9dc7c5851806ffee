use std::sync::atomic::Ordering;

/// The ordering used for all atomic flags shared between dtq tasks.
pub const ORDERING: Ordering = Ordering::SeqCst;
