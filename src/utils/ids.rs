//! Process-wide core instance ids
//!
//! Ids are handed out once per [`Core`](crate::core::Core) and never
//! reused, so log lines stay attributable even across reconnects.

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_CORE_ID: AtomicUsize = AtomicUsize::new(0);

/// Hand out the next unused instance id
pub(crate) fn next_core_id() -> usize {
    NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::next_core_id;

    #[test]
    fn ids_are_distinct_and_increasing() {
        let a = next_core_id();
        let b = next_core_id();
        assert!(b > a);
    }
}
