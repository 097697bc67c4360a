//! Blocking-to-cooperative translation of hooked calls
//!
//! ```text
//!   hooked read(fd) ─► hook off / not a socket / user non-blocking ─► real read
//!        │
//!        ▼
//!   real read ── EINTR ──► again
//!        │
//!        ├─ done ─────────────────────────────────────────────► return
//!        └─ EAGAIN ─► [timeout timer] + add_event(fd, READ) ─► yield
//!                         │                                      │
//!                         └── fires: cancel_event ──► wakes ─────┤
//!                                                                ▼
//!                                        timed out? ─► -1/ETIMEDOUT, else retry
//! ```

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use cofiber_core::{CancellationToken, Interest};
use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    useconds_t,
};
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{connect_timeout, set_errno, FdCtx, FdManager, SyscallTable, Syscalls};
use crate::config::NO_TIMEOUT;
use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;
use crate::tls;

/// Hooked versions of the blocking calls, over a [`Syscalls`] backend
pub struct Interceptor {
    sys: Arc<dyn Syscalls>,
    fds: FdManager,
}

impl Interceptor {
    pub fn new(sys: Arc<dyn Syscalls>) -> Interceptor {
        Interceptor { sys, fds: FdManager::new() }
    }

    /// The process-wide interceptor over the real syscalls
    pub fn global() -> &'static Interceptor {
        static GLOBAL: OnceLock<Interceptor> = OnceLock::new();
        GLOBAL.get_or_init(|| Interceptor::new(Arc::new(*SyscallTable::global())))
    }

    #[inline]
    pub fn syscalls(&self) -> &dyn Syscalls {
        &*self.sys
    }

    #[inline]
    pub fn fds(&self) -> &FdManager {
        &self.fds
    }

    /// Register a descriptor created outside the hooked `socket`/`accept`
    /// (e.g. by `socketpair`), forcing sockets non-blocking
    pub fn register_fd(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        self.fds.get(fd, true, &*self.sys)
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        self.fds.get(fd, false, &*self.sys)
    }

    /// Shared retry/suspend loop for the read and write families
    fn do_io<F>(&self, fd: RawFd, name: &'static str, direction: Interest, mut call: F) -> ssize_t
    where
        F: FnMut() -> ssize_t,
    {
        if !tls::hook_enabled() {
            return call();
        }
        let Some(ctx) = self.lookup(fd) else { return call() };
        if ctx.is_closed() {
            set_errno(Errno::EBADF);
            return -1;
        }
        if !ctx.is_socket() || ctx.user_nonblock() {
            return call();
        }
        let timeout = ctx.timeout(direction);

        loop {
            let mut n = call();
            while n == -1 && Errno::last() == Errno::EINTR {
                n = call();
            }
            if n != -1 || Errno::last() != Errno::EAGAIN {
                return n;
            }
            let Some(reactor) = suspendable() else { return n };

            if let Err(err) = self.wait_ready(&reactor, fd, name, direction, timeout) {
                set_errno(err);
                return -1;
            }
            if ctx.is_closed() {
                set_errno(Errno::EBADF);
                return -1;
            }
        }
    }

    /// Park the current fiber until `fd` is ready for `direction`, or until
    /// `timeout` ms have passed
    fn wait_ready(
        &self,
        reactor: &Arc<Reactor>,
        fd: RawFd,
        name: &'static str,
        direction: Interest,
        timeout: Option<u64>,
    ) -> Result<(), Errno> {
        let token = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        let timer = timeout.map(|ms| {
            let flag = Arc::clone(&timed_out);
            let weak = Arc::downgrade(reactor);
            reactor.add_condition_timer(
                ms,
                move || {
                    if flag.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    if let Some(reactor) = weak.upgrade() {
                        reactor.cancel_event(fd, direction);
                    }
                },
                token.guard(),
                false,
            )
        });

        Errno::clear();
        if let Err(e) = reactor.add_event(fd, direction, None) {
            error!(fd, call = name, error = %e, "hooked call could not arm its event");
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(e.errno().unwrap_or(Errno::EIO));
        }

        Fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        token.cancel();
        if timed_out.load(Ordering::Acquire) {
            debug!(fd, call = name, ms = timeout.unwrap_or(0), "hooked call timed out");
            return Err(Errno::ETIMEDOUT);
        }
        Ok(())
    }

    /// Suspend the current fiber for `ms` on a reactor timer.
    ///
    /// Returns `false` when the caller should fall back to a real sleep.
    fn suspend_for(&self, ms: u64) -> bool {
        if !tls::hook_enabled() {
            return false;
        }
        let (Some(reactor), Some(scheduler)) = (suspendable(), Scheduler::current()) else {
            return false;
        };
        let waiter = Mutex::new(Some(Fiber::current()));
        reactor.add_timer(
            ms,
            move || {
                if let Some(fiber) = waiter.lock().take() {
                    scheduler.schedule(fiber, None);
                }
            },
            false,
        );
        Fiber::yield_now();
        true
    }

    pub unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        self.do_io(fd, "read", Interest::READ, || unsafe { self.sys.read(fd, buf, count) })
    }

    pub unsafe fn readv(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        self.do_io(fd, "readv", Interest::READ, || unsafe { self.sys.readv(fd, iov, iovcnt) })
    }

    pub unsafe fn recv(&self, fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
        self.do_io(fd, "recv", Interest::READ, || unsafe { self.sys.recv(fd, buf, len, flags) })
    }

    pub unsafe fn recvfrom(
        &self,
        fd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t {
        self.do_io(fd, "recvfrom", Interest::READ, || unsafe {
            self.sys.recvfrom(fd, buf, len, flags, addr, addrlen)
        })
    }

    pub unsafe fn recvmsg(&self, fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
        self.do_io(fd, "recvmsg", Interest::READ, || unsafe { self.sys.recvmsg(fd, msg, flags) })
    }

    pub unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
        self.do_io(fd, "write", Interest::WRITE, || unsafe { self.sys.write(fd, buf, count) })
    }

    pub unsafe fn writev(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        self.do_io(fd, "writev", Interest::WRITE, || unsafe { self.sys.writev(fd, iov, iovcnt) })
    }

    pub unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        self.do_io(fd, "send", Interest::WRITE, || unsafe { self.sys.send(fd, buf, len, flags) })
    }

    pub unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        self.do_io(fd, "sendto", Interest::WRITE, || unsafe {
            self.sys.sendto(fd, buf, len, flags, addr, addrlen)
        })
    }

    pub unsafe fn sendmsg(&self, fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
        self.do_io(fd, "sendmsg", Interest::WRITE, || unsafe { self.sys.sendmsg(fd, msg, flags) })
    }

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        let fd = self.sys.socket(domain, ty, protocol);
        if fd >= 0 && tls::hook_enabled() {
            self.register_fd(fd);
        }
        fd
    }

    /// `connect` bounded by the process-wide connect timeout
    pub unsafe fn connect(&self, fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        self.connect_with_timeout(fd, addr, len, connect_timeout())
    }

    /// `connect` that gives up with `ETIMEDOUT` after `timeout_ms`
    /// (`u64::MAX`: never)
    pub unsafe fn connect_with_timeout(
        &self,
        fd: c_int,
        addr: *const sockaddr,
        len: socklen_t,
        timeout_ms: u64,
    ) -> c_int {
        if !tls::hook_enabled() {
            return self.sys.connect(fd, addr, len);
        }
        let Some(ctx) = self.lookup(fd) else {
            set_errno(Errno::EBADF);
            return -1;
        };
        if ctx.is_closed() {
            set_errno(Errno::EBADF);
            return -1;
        }
        if !ctx.is_socket() || ctx.user_nonblock() {
            return self.sys.connect(fd, addr, len);
        }

        let n = self.sys.connect(fd, addr, len);
        if n == 0 || Errno::last() != Errno::EINPROGRESS {
            return n;
        }
        let Some(reactor) = suspendable() else { return n };

        let timeout = (timeout_ms != NO_TIMEOUT).then_some(timeout_ms);
        if let Err(err) = self.wait_ready(&reactor, fd, "connect", Interest::WRITE, timeout) {
            set_errno(err);
            return -1;
        }

        let mut so_error: c_int = 0;
        let mut so_len = std::mem::size_of::<c_int>() as socklen_t;
        let rc = self.sys.getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut so_error as *mut c_int).cast(),
            &mut so_len,
        );
        if rc == -1 {
            return -1;
        }
        if so_error == 0 {
            0
        } else {
            set_errno(Errno::from_raw(so_error));
            -1
        }
    }

    pub unsafe fn accept(&self, fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
        let conn = self.do_io(fd, "accept", Interest::READ, || unsafe {
            self.sys.accept(fd, addr, len) as ssize_t
        }) as c_int;
        if conn >= 0 && tls::hook_enabled() {
            self.register_fd(conn);
        }
        conn
    }

    /// Wake everything waiting on `fd`, forget it, then close it
    pub fn close(&self, fd: c_int) -> c_int {
        if !tls::hook_enabled() {
            return self.sys.close(fd);
        }
        if let Some(ctx) = self.lookup(fd) {
            ctx.mark_closed();
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all(fd);
            }
            self.fds.del(fd);
        }
        self.sys.close(fd)
    }

    /// Tracks `O_NONBLOCK` as the application sees it; the socket itself
    /// stays non-blocking
    pub unsafe fn fcntl(&self, fd: c_int, cmd: c_int, arg: usize) -> c_int {
        let ctx = self.lookup(fd).filter(|c| !c.is_closed() && c.is_socket());
        match (cmd, ctx) {
            (libc::F_SETFL, Some(ctx)) => {
                let flags = arg as c_int;
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                let flags = if ctx.sys_nonblock() {
                    flags | libc::O_NONBLOCK
                } else {
                    flags & !libc::O_NONBLOCK
                };
                self.sys.fcntl(fd, cmd, flags as usize)
            }
            (libc::F_GETFL, Some(ctx)) => {
                let flags = self.sys.fcntl(fd, cmd, 0);
                if flags == -1 {
                    return flags;
                }
                if ctx.user_nonblock() {
                    flags | libc::O_NONBLOCK
                } else {
                    flags & !libc::O_NONBLOCK
                }
            }
            _ => self.sys.fcntl(fd, cmd, arg),
        }
    }

    pub unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        if request == libc::FIONBIO as c_ulong && !arg.is_null() {
            let on = *(arg as *const c_int) != 0;
            if let Some(ctx) = self.lookup(fd).filter(|c| !c.is_closed() && c.is_socket()) {
                ctx.set_user_nonblock(on);
            }
        }
        self.sys.ioctl(fd, request, arg)
    }

    pub unsafe fn getsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int {
        self.sys.getsockopt(fd, level, name, value, len)
    }

    /// Records `SO_RCVTIMEO`/`SO_SNDTIMEO` for the hooked wait, then passes
    /// the option on
    pub unsafe fn setsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *const c_void,
        len: socklen_t,
    ) -> c_int {
        if tls::hook_enabled()
            && level == libc::SOL_SOCKET
            && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
            && !value.is_null()
            && len as usize >= std::mem::size_of::<libc::timeval>()
        {
            if let Some(ctx) = self.lookup(fd) {
                let tv = &*(value as *const libc::timeval);
                let ms = tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
                let direction = if name == libc::SO_RCVTIMEO { Interest::READ } else { Interest::WRITE };
                ctx.set_timeout(direction, ms);
            }
        }
        self.sys.setsockopt(fd, level, name, value, len)
    }

    pub fn sleep(&self, secs: c_uint) -> c_uint {
        if self.suspend_for(secs as u64 * 1000) {
            0
        } else {
            self.sys.sleep(secs)
        }
    }

    pub fn usleep(&self, usec: useconds_t) -> c_int {
        if self.suspend_for(usec as u64 / 1000) {
            0
        } else {
            self.sys.usleep(usec)
        }
    }

    pub unsafe fn nanosleep(&self, req: *const timespec, rem: *mut timespec) -> c_int {
        if req.is_null() {
            return self.sys.nanosleep(req, rem);
        }
        let ts = &*req;
        let ms = ts.tv_sec.max(0) as u64 * 1000 + ts.tv_nsec.max(0) as u64 / 1_000_000;
        if self.suspend_for(ms) {
            0
        } else {
            self.sys.nanosleep(req, rem)
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor").field("fds", &self.fds.len()).finish()
    }
}

/// The current reactor, if the caller is a fiber that may be suspended
fn suspendable() -> Option<Arc<Reactor>> {
    if !Fiber::in_fiber() {
        return None;
    }
    Reactor::current()
}
