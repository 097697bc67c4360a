//! Fiber stack memory
//!
//! Every stackful fiber owns one [`Stack`]: an anonymous private mapping
//! with a `PROT_NONE` guard page at its low end, so running off the
//! bottom of a fiber stack faults instead of scribbling on a neighbour.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}

/// Round `len` up to a multiple of `page`
#[inline]
pub(crate) fn round_to_page(len: usize, page: usize) -> usize {
    (len + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_page() {
        assert_eq!(round_to_page(1, 4096), 4096);
        assert_eq!(round_to_page(4096, 4096), 4096);
        assert_eq!(round_to_page(4097, 4096), 8192);
    }

    #[test]
    fn test_stack_is_writable_end_to_end() {
        let stack = Stack::new(32 * 1024).unwrap();
        assert!(stack.usable_size() >= 32 * 1024);
        unsafe {
            // lowest and highest usable bytes
            let low = stack.top().sub(stack.usable_size());
            low.write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(low.read(), 0xAB);
        }
    }

    #[test]
    fn test_stack_rejects_tiny_size() {
        assert!(Stack::new(64).is_err());
    }

    #[test]
    fn test_stack_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Stack>();
    }
}
