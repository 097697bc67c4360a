//! Syscall interception
//!
//! Blocking calls on sockets, made from a fiber on an [`IoManager`] worker,
//! park the fiber on the reactor instead of blocking the thread. Everywhere
//! else they behave exactly like the libc call they wrap.
//!
//! The functions below go through [`Interceptor::global()`]. With the
//! `interpose` feature they are also exported under the libc names, so
//! code that calls `read(2)` directly is intercepted too.
//!
//! Hooking is per thread: scheduler workers turn it on for themselves,
//! other threads start with it off.
//!
//! [`IoManager`]: crate::reactor::IoManager

mod fd_manager;
mod interceptor;
mod syscalls;

#[cfg(feature = "interpose")]
mod interpose;

pub use fd_manager::{FdCtx, FdManager};
pub use interceptor::Interceptor;
pub use syscalls::{SyscallTable, Syscalls};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    useconds_t,
};
use nix::errno::Errno;

use crate::config::RuntimeConfig;
use crate::tls;

/// Whether hooked calls on this thread may suspend the calling fiber
#[inline]
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

#[inline]
pub fn set_hook_enabled(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

fn connect_timeout_cell() -> &'static AtomicU64 {
    static CELL: OnceLock<AtomicU64> = OnceLock::new();
    CELL.get_or_init(|| AtomicU64::new(RuntimeConfig::global().connect_timeout_ms))
}

/// Timeout applied by the hooked `connect`, in ms (`u64::MAX`: none)
pub fn connect_timeout() -> u64 {
    connect_timeout_cell().load(Ordering::Relaxed)
}

pub fn set_connect_timeout(ms: u64) {
    connect_timeout_cell().store(ms, Ordering::Relaxed);
}

#[inline]
pub(crate) fn set_errno(err: Errno) {
    unsafe { *libc::__errno_location() = err as c_int };
}

pub fn sleep(secs: c_uint) -> c_uint {
    Interceptor::global().sleep(secs)
}

pub fn usleep(usec: useconds_t) -> c_int {
    Interceptor::global().usleep(usec)
}

pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    Interceptor::global().nanosleep(req, rem)
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    Interceptor::global().socket(domain, ty, protocol)
}

pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    Interceptor::global().connect(fd, addr, len)
}

pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    Interceptor::global().connect_with_timeout(fd, addr, len, timeout_ms)
}

pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    Interceptor::global().accept(fd, addr, len)
}

pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    Interceptor::global().read(fd, buf, count)
}

pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    Interceptor::global().readv(fd, iov, iovcnt)
}

pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    Interceptor::global().recv(fd, buf, len, flags)
}

pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    Interceptor::global().recvfrom(fd, buf, len, flags, addr, addrlen)
}

pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    Interceptor::global().recvmsg(fd, msg, flags)
}

pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    Interceptor::global().write(fd, buf, count)
}

pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    Interceptor::global().writev(fd, iov, iovcnt)
}

pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    Interceptor::global().send(fd, buf, len, flags)
}

pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    Interceptor::global().sendto(fd, buf, len, flags, addr, addrlen)
}

pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    Interceptor::global().sendmsg(fd, msg, flags)
}

pub fn close(fd: c_int) -> c_int {
    Interceptor::global().close(fd)
}

pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    Interceptor::global().fcntl(fd, cmd, arg)
}

pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    Interceptor::global().ioctl(fd, request, arg)
}

pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    Interceptor::global().getsockopt(fd, level, name, value, len)
}

pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    Interceptor::global().setsockopt(fd, level, name, value, len)
}
