use std::cell::Cell;

thread_local! {
    /// Guest thread currently dispatched on this OS thread (0 = none).
    ///
    /// Bound per OS thread rather than process-wide, so concurrent fast
    /// calls on different OS threads save and restore their own binding
    /// without racing.
    static ACTIVE_THREAD: Cell<u32> = const { Cell::new(0) };
}

/// Id of the guest thread currently dispatched on the calling OS thread,
/// or 0 when none is bound.
pub fn active_thread_id() -> u32 {
    ACTIVE_THREAD.get()
}

/// Rebinds the calling OS thread's active guest thread and returns the
/// previous binding so the caller can restore it.
pub fn bind_active(id: u32) -> u32 {
    ACTIVE_THREAD.replace(id)
}
