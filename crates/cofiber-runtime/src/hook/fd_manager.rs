//! Per-descriptor state for hooked calls

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cofiber_core::Interest;
use parking_lot::RwLock;
use tracing::trace;

use super::Syscalls;
use crate::config::{defaults, NO_TIMEOUT};

/// What the hook layer knows about one descriptor
pub struct FdCtx {
    fd: RawFd,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    /// We forced O_NONBLOCK on it
    sys_nonblock: AtomicBool,
    /// The application asked for O_NONBLOCK itself
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd, sys: &dyn Syscalls) -> FdCtx {
        let ctx = FdCtx {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        };
        ctx.init(sys);
        ctx
    }

    /// Classify the fd and put sockets into non-blocking mode
    fn init(&self, sys: &dyn Syscalls) -> bool {
        if self.is_init.load(Ordering::Acquire) {
            return true;
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let known = unsafe { sys.fstat(self.fd, &mut st) } == 0;
        let is_socket = known && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        self.is_socket.store(is_socket, Ordering::Release);

        if is_socket {
            let flags = unsafe { sys.fcntl(self.fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { sys.fcntl(self.fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as usize) };
            }
            self.sys_nonblock.store(true, Ordering::Release);
        }
        self.is_init.store(known, Ordering::Release);
        trace!(fd = self.fd, known, is_socket, "fd registered");
        known
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// `SO_RCVTIMEO` for READ, `SO_SNDTIMEO` for WRITE; `None` blocks forever
    pub fn timeout(&self, direction: Interest) -> Option<u64> {
        let ms = self.timeout_cell(direction).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    /// Zero means no timeout, as with the socket options
    pub fn set_timeout(&self, direction: Interest, ms: u64) {
        let ms = if ms == 0 { NO_TIMEOUT } else { ms };
        self.timeout_cell(direction).store(ms, Ordering::Release);
    }

    fn timeout_cell(&self, direction: Interest) -> &AtomicU64 {
        if direction == Interest::READ {
            &self.recv_timeout
        } else {
            &self.send_timeout
        }
    }
}

impl std::fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("socket", &self.is_socket())
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Growable fd-indexed table of [`FdCtx`]
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn new() -> Self {
        Self { slots: RwLock::new(vec![None; defaults::HOOK_FD_TABLE]) }
    }

    /// Context for `fd`; with `auto_create`, classify and register it first
    pub fn get(&self, fd: RawFd, auto_create: bool, sys: &dyn Syscalls) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let new_len = (idx + idx / 2).max(idx + 1);
            slots.resize(new_len, None);
            trace!(len = new_len, "hook fd table grown");
        }
        let ctx = slots[idx].get_or_insert_with(|| Arc::new(FdCtx::new(fd, sys)));
        Some(Arc::clone(ctx))
    }

    /// Forget `fd`; holders of its context keep a closed, detached copy
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Some(slot) = self.slots.write().get_mut(fd as usize) {
            slot.take();
        }
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::SyscallTable;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        (fds[0], fds[1])
    }

    #[test]
    fn test_socket_is_forced_nonblocking() {
        let sys = SyscallTable::global();
        let fds = FdManager::new();
        let (a, b) = socketpair();

        let ctx = fds.get(a, true, sys).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        // the peer was never touched
        let flags = unsafe { libc::fcntl(b, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_pipe_is_not_a_socket() {
        let sys = SyscallTable::global();
        let fds = FdManager::new();
        let mut p = [0; 2];
        assert_eq!(unsafe { libc::pipe(p.as_mut_ptr()) }, 0);
        let ctx = fds.get(p[0], true, sys).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        unsafe {
            libc::close(p[0]);
            libc::close(p[1]);
        }
    }

    #[test]
    fn test_lookup_growth_and_delete() {
        let sys = SyscallTable::global();
        let fds = FdManager::new();
        assert!(fds.get(-1, true, sys).is_none());
        assert!(fds.get(500, false, sys).is_none());

        // unknown fds still get a context, marked uninitialised
        let ctx = fds.get(500, true, sys).unwrap();
        assert!(!ctx.is_init());
        assert!(fds.get(500, false, sys).is_some());
        assert_eq!(fds.len(), 1);

        fds.del(500);
        assert!(fds.get(500, false, sys).is_none());
        assert!(fds.is_empty());
    }

    #[test]
    fn test_timeouts() {
        let sys = SyscallTable::global();
        let fds = FdManager::new();
        let ctx = fds.get(400, true, sys).unwrap();
        assert_eq!(ctx.timeout(Interest::READ), None);

        ctx.set_timeout(Interest::READ, 250);
        ctx.set_timeout(Interest::WRITE, 10);
        assert_eq!(ctx.timeout(Interest::READ), Some(250));
        assert_eq!(ctx.timeout(Interest::WRITE), Some(10));

        ctx.set_timeout(Interest::READ, 0);
        assert_eq!(ctx.timeout(Interest::READ), None);
    }
}
