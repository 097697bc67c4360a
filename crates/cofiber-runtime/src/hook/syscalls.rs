//! Registry of the real (un-hooked) syscalls
//!
//! Every entry is resolved once with `dlsym(RTLD_NEXT, name)`, so the
//! table still reaches libc when this crate's `interpose` feature shadows
//! the same symbols in the final binary. The [`Syscalls`] trait is the seam
//! tests use to substitute a fake kernel.

use std::ffi::CStr;
use std::sync::OnceLock;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, stat,
    timespec, useconds_t,
};
use tracing::debug;

/// The platform calls the hook layer wraps
///
/// Methods taking raw pointers are `unsafe` with the same contract as the
/// libc function of the same name.
pub trait Syscalls: Send + Sync + 'static {
    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    unsafe fn readv(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    unsafe fn recv(&self, fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    unsafe fn recvfrom(
        &self,
        fd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t;
    unsafe fn recvmsg(&self, fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t;

    unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    unsafe fn writev(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t;
    unsafe fn sendmsg(&self, fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t;

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int;
    unsafe fn connect(&self, fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int;
    unsafe fn accept(&self, fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int;
    fn close(&self, fd: c_int) -> c_int;

    /// `arg` carries either an integer or a pointer, depending on `cmd`
    unsafe fn fcntl(&self, fd: c_int, cmd: c_int, arg: usize) -> c_int;
    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int;
    unsafe fn getsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int;
    unsafe fn setsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *const c_void,
        len: socklen_t,
    ) -> c_int;

    fn sleep(&self, secs: c_uint) -> c_uint;
    fn usleep(&self, usec: useconds_t) -> c_int;
    unsafe fn nanosleep(&self, req: *const timespec, rem: *mut timespec) -> c_int;

    unsafe fn fstat(&self, fd: c_int, buf: *mut stat) -> c_int;
}

type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type RecvfromFn =
    unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type SendtoFn =
    unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
type SetsockoptFn = unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
type UsleepFn = unsafe extern "C" fn(useconds_t) -> c_int;
type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
type FstatFn = unsafe extern "C" fn(c_int, *mut stat) -> c_int;

/// Function pointers to the next definition of each wrapped symbol
#[derive(Clone, Copy)]
pub struct SyscallTable {
    read: ReadFn,
    readv: ReadvFn,
    recv: RecvFn,
    recvfrom: RecvfromFn,
    recvmsg: RecvmsgFn,
    write: WriteFn,
    writev: WritevFn,
    send: SendFn,
    sendto: SendtoFn,
    sendmsg: SendmsgFn,
    socket: SocketFn,
    connect: ConnectFn,
    accept: AcceptFn,
    close: CloseFn,
    fcntl: FcntlFn,
    ioctl: IoctlFn,
    getsockopt: GetsockoptFn,
    setsockopt: SetsockoptFn,
    sleep: SleepFn,
    usleep: UsleepFn,
    nanosleep: NanosleepFn,
    fstat: FstatFn,
}

/// Look `name` up past the current object, or keep the libc binding
///
/// # Safety
/// `F` must be a function pointer type matching the C prototype of `name`.
unsafe fn resolve<F: Copy>(name: &CStr, fallback: F) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        debug!(symbol = ?name, "dlsym found nothing; using libc binding");
        return fallback;
    }
    std::mem::transmute_copy::<*mut c_void, F>(&sym)
}

impl SyscallTable {
    /// Resolve every entry now
    pub fn resolve() -> SyscallTable {
        unsafe {
            SyscallTable {
                read: resolve(c"read", libc::read as ReadFn),
                readv: resolve(c"readv", libc::readv as ReadvFn),
                recv: resolve(c"recv", libc::recv as RecvFn),
                recvfrom: resolve(c"recvfrom", libc::recvfrom as RecvfromFn),
                recvmsg: resolve(c"recvmsg", libc::recvmsg as RecvmsgFn),
                write: resolve(c"write", libc::write as WriteFn),
                writev: resolve(c"writev", libc::writev as WritevFn),
                send: resolve(c"send", libc::send as SendFn),
                sendto: resolve(c"sendto", libc::sendto as SendtoFn),
                sendmsg: resolve(c"sendmsg", libc::sendmsg as SendmsgFn),
                socket: resolve(c"socket", libc::socket as SocketFn),
                connect: resolve(c"connect", libc::connect as ConnectFn),
                accept: resolve(c"accept", libc::accept as AcceptFn),
                close: resolve(c"close", libc::close as CloseFn),
                fcntl: resolve(c"fcntl", libc::fcntl as FcntlFn),
                ioctl: resolve(c"ioctl", libc::ioctl as IoctlFn),
                getsockopt: resolve(c"getsockopt", libc::getsockopt as GetsockoptFn),
                setsockopt: resolve(c"setsockopt", libc::setsockopt as SetsockoptFn),
                sleep: resolve(c"sleep", libc::sleep as SleepFn),
                usleep: resolve(c"usleep", libc::usleep as UsleepFn),
                nanosleep: resolve(c"nanosleep", libc::nanosleep as NanosleepFn),
                fstat: resolve(c"fstat", libc::fstat as FstatFn),
            }
        }
    }

    /// Process-wide table, resolved on first use
    pub fn global() -> &'static SyscallTable {
        static TABLE: OnceLock<SyscallTable> = OnceLock::new();
        TABLE.get_or_init(SyscallTable::resolve)
    }
}

impl Syscalls for SyscallTable {
    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        (self.read)(fd, buf, count)
    }

    unsafe fn readv(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        (self.readv)(fd, iov, iovcnt)
    }

    unsafe fn recv(&self, fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
        (self.recv)(fd, buf, len, flags)
    }

    unsafe fn recvfrom(
        &self,
        fd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t {
        (self.recvfrom)(fd, buf, len, flags, addr, addrlen)
    }

    unsafe fn recvmsg(&self, fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
        (self.recvmsg)(fd, msg, flags)
    }

    unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
        (self.write)(fd, buf, count)
    }

    unsafe fn writev(&self, fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        (self.writev)(fd, iov, iovcnt)
    }

    unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        (self.send)(fd, buf, len, flags)
    }

    unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        (self.sendto)(fd, buf, len, flags, addr, addrlen)
    }

    unsafe fn sendmsg(&self, fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
        (self.sendmsg)(fd, msg, flags)
    }

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        unsafe { (self.socket)(domain, ty, protocol) }
    }

    unsafe fn connect(&self, fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        (self.connect)(fd, addr, len)
    }

    unsafe fn accept(&self, fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
        (self.accept)(fd, addr, len)
    }

    fn close(&self, fd: c_int) -> c_int {
        unsafe { (self.close)(fd) }
    }

    unsafe fn fcntl(&self, fd: c_int, cmd: c_int, arg: usize) -> c_int {
        (self.fcntl)(fd, cmd, arg)
    }

    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        (self.ioctl)(fd, request, arg)
    }

    unsafe fn getsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int {
        (self.getsockopt)(fd, level, name, value, len)
    }

    unsafe fn setsockopt(
        &self,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: *const c_void,
        len: socklen_t,
    ) -> c_int {
        (self.setsockopt)(fd, level, name, value, len)
    }

    fn sleep(&self, secs: c_uint) -> c_uint {
        unsafe { (self.sleep)(secs) }
    }

    fn usleep(&self, usec: useconds_t) -> c_int {
        unsafe { (self.usleep)(usec) }
    }

    unsafe fn nanosleep(&self, req: *const timespec, rem: *mut timespec) -> c_int {
        (self.nanosleep)(req, rem)
    }

    unsafe fn fstat(&self, fd: c_int, buf: *mut stat) -> c_int {
        (self.fstat)(fd, buf)
    }
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable")
            .field("read", &(self.read as *const c_void))
            .field("write", &(self.write as *const c_void))
            .finish_non_exhaustive()
    }
}
