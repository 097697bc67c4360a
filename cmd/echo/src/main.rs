//! cofiber Echo Server
//!
//! TCP echo server written as plain blocking code: one fiber per
//! connection, each doing `read` then `write` in a loop. The hooked calls
//! park the fiber on the reactor whenever the socket would block.
//!
//! Usage:
//!     cargo build --release -p cofiber-echo
//!     ./target/release/echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use cofiber::{hook, IoManager, SchedResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BUF_SIZE: usize = 4096;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn print(&self, live: usize, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] conns={} accepts={} close={} bytes={} err={}",
            elapsed_secs,
            live,
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

/// Open fds, so shutdown can close them and wake their fibers
type Live = Arc<Mutex<HashSet<RawFd>>>;

// ── Setup listener (main thread is unhooked, so register it by hand) ──

fn setup_listener(port: u16) -> std::io::Result<RawFd> {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        let opt: libc::c_int = 1;
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&opt as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        addr.sin_port = port.to_be();

        let len = std::mem::size_of_val(&addr) as libc::socklen_t;
        if libc::bind(fd, (&addr as *const libc::sockaddr_in).cast(), len) != 0
            || libc::listen(fd, 1024) != 0
        {
            let err = std::io::Error::last_os_error();
            hook::close(fd);
            return Err(err);
        }
    }
    // Forces O_NONBLOCK so accept() parks the fiber instead of the worker
    hook::Interceptor::global().register_fd(fd);
    Ok(fd)
}

fn serve(fd: RawFd, stats: &Stats) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            if n < 0 {
                debug!(fd, error = %std::io::Error::last_os_error(), "read failed");
            }
            return;
        }
        let mut off = 0;
        while off < n as usize {
            let w = unsafe { hook::write(fd, buf[off..].as_ptr().cast(), n as usize - off) };
            if w <= 0 {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            off += w as usize;
        }
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn accept_loop(iom: Arc<IoManager>, listener: RawFd, live: Live, stats: Arc<Stats>) {
    loop {
        let conn = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBADF) {
                info!("listener closed, accept loop done");
                return;
            }
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "accept failed");
            continue;
        }
        stats.accepts.fetch_add(1, Ordering::Relaxed);
        live.lock().insert(conn);

        let (live, stats) = (live.clone(), stats.clone());
        iom.schedule_fn(move || {
            serve(conn, &stats);
            if live.lock().remove(&conn) {
                hook::close(conn);
                stats.closes.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
}

fn main() -> SchedResult<()> {
    cofiber::init_logging();
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let workers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    let listener = match setup_listener(port) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("echo: cannot listen on port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    let iom = Arc::new(IoManager::new(workers, false, "echo")?);
    let live: Live = Arc::new(Mutex::new(HashSet::new()));
    let stats = Arc::new(Stats::default());

    {
        let (iom2, live, stats) = (iom.clone(), live.clone(), stats.clone());
        iom.schedule_fn(move || accept_loop(iom2, listener, live, stats));
    }
    eprintln!("echo: listening on 0.0.0.0:{} with {} workers", port, workers);

    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_stats.elapsed() >= Duration::from_secs(5) {
            stats.print(live.lock().len(), start.elapsed().as_secs_f64());
            last_stats = Instant::now();
        }
    }

    // Close from inside a fiber so the reactor cancels parked reads
    info!("shutting down");
    {
        let live = live.clone();
        iom.schedule_fn(move || {
            hook::close(listener);
            let fds: Vec<RawFd> = live.lock().drain().collect();
            for fd in fds {
                hook::close(fd);
            }
        });
    }
    iom.stop();

    stats.print(0, start.elapsed().as_secs_f64());
    eprintln!("echo: shutdown complete");
    Ok(())
}
