//! Architecture-specific context switching
//!
//! A fiber's machine context is whatever an [`ExecutionContext`]
//! implementation saves on a switch. Only x86_64 System V has a backend;
//! other targets stop at `compile_error!` in `lib.rs` rather than falling
//! back to thread-backed fibers.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    }
}

/// First code a fresh context runs. Receives the `arg` given to
/// [`ExecutionContext::create_with_stack`] and must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

/// Saved machine state of a suspended execution
///
/// `Default` is the blank context of a thread that has not been switched
/// away from yet; it is filled in by the first `swap` out of it.
pub trait ExecutionContext: Default + Send {
    /// Build a context that starts `entry(arg)` on a fresh stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the high end of a writable region that stays
    /// mapped for as long as the context may run.
    unsafe fn create_with_stack(stack_top: *mut u8, entry: EntryFn, arg: usize) -> Self;

    /// Suspend the running execution into `suspend` and resume `resume`.
    ///
    /// Returns when something later swaps back into `suspend`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of the switch, and
    /// `resume` must hold a context produced by `create_with_stack` or by a
    /// previous `swap`.
    unsafe fn swap(suspend: *mut Self, resume: *const Self);
}
