use std::sync::atomic::{AtomicUsize, Ordering};

mod quiescence_tests;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Segment name no other test (or test run) uses.
pub(crate) fn unique_name(prefix: &str) -> String {
    static SHMEM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/{}-{}-{}",
        prefix,
        std::process::id(),
        SHMEM_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}
