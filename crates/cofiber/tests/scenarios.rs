//! End-to-end runs through the public API

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cofiber::hook::{self, Interceptor};
use cofiber::{Interest, IoManager, Scheduler};

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn thousand_fibers_drain_before_stop_returns() {
    cofiber::init_logging();
    let scheduler = Scheduler::new(4, false, "drain").unwrap();
    scheduler.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let d = Arc::clone(&done);
        scheduler.schedule_fn(move || {
            for _ in 0..3 {
                cofiber::yield_now();
            }
            d.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();
    assert_eq!(done.load(Ordering::SeqCst), 1000);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn use_caller_scheduler_drains_on_stop() {
    let scheduler = Scheduler::new(1, true, "caller").unwrap();
    scheduler.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let d = Arc::clone(&done);
        scheduler.schedule_fn(move || {
            cofiber::yield_now();
            d.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.stop();
    assert_eq!(done.load(Ordering::SeqCst), 100);
}

#[test]
fn hooked_read_times_out_with_etimedout() {
    let iom = IoManager::new(1, false, "scenario-timeout").unwrap();
    let (a, b) = socketpair();
    Interceptor::global().register_fd(a).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let o = Arc::clone(&outcome);
    iom.schedule_fn(move || unsafe {
        let tv = libc::timeval { tv_sec: 0, tv_usec: 100_000 };
        hook::setsockopt(
            a,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&tv as *const libc::timeval).cast(),
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        let start = Instant::now();
        let mut buf = [0u8; 8];
        let n = hook::read(a, buf.as_mut_ptr().cast(), buf.len());
        *o.lock().unwrap() = Some((n, errno(), start.elapsed()));
    });

    assert!(wait_until(|| outcome.lock().unwrap().is_some()));
    iom.stop();

    let (n, err, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(95), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    hook::close(a);
    unsafe { libc::close(b) };
}

#[test]
fn close_wakes_fiber_blocked_in_read() {
    let iom = IoManager::new(2, false, "scenario-close").unwrap();
    let (a, b) = socketpair();
    Interceptor::global().register_fd(a).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let o = Arc::clone(&outcome);
    iom.schedule_fn(move || {
        let mut buf = [0u8; 8];
        let n = unsafe { hook::read(a, buf.as_mut_ptr().cast(), buf.len()) };
        *o.lock().unwrap() = Some((n, errno()));
    });

    assert!(wait_until(|| iom.pending_event_count() == 1));
    iom.schedule_fn(move || {
        hook::close(a);
    });

    assert!(wait_until(|| outcome.lock().unwrap().is_some()));
    iom.stop();
    assert_eq!(*outcome.lock().unwrap(), Some((-1, libc::EBADF)));
    assert_eq!(iom.pending_event_count(), 0);
    unsafe { libc::close(b) };
}

#[test]
fn refused_connect_error_wakes_both_directions() {
    // A port nobody listens on any more
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let iom = IoManager::new(1, false, "scenario-err").unwrap();
    let fd = unsafe {
        libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0)
    };
    assert!(fd >= 0);

    let read_fired = Arc::new(AtomicBool::new(false));
    let write_fired = Arc::new(AtomicBool::new(false));
    let (r, w) = (Arc::clone(&read_fired), Arc::clone(&write_fired));
    iom.add_event(fd, Interest::READ, Some(Box::new(move || r.store(true, Ordering::SeqCst))))
        .unwrap();
    iom.add_event(fd, Interest::WRITE, Some(Box::new(move || w.store(true, Ordering::SeqCst))))
        .unwrap();

    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        libc::connect(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
    }

    assert!(wait_until(|| {
        read_fired.load(Ordering::SeqCst) && write_fired.load(Ordering::SeqCst)
    }));
    assert_eq!(iom.pending_event_count(), 0);
    iom.stop();
    unsafe { libc::close(fd) };
}

#[test]
fn recurring_timer_keeps_its_cadence() {
    let iom = IoManager::new(1, false, "scenario-cadence").unwrap();
    let fires = Arc::new(Mutex::new(Vec::new()));

    let f = Arc::clone(&fires);
    let start = Instant::now();
    let handle = iom.add_timer(20, move || f.lock().unwrap().push(start.elapsed()), true);

    assert!(wait_until(|| fires.lock().unwrap().len() >= 5));
    assert!(handle.cancel());
    iom.stop();

    let fires = fires.lock().unwrap();
    for (i, at) in fires.iter().take(5).enumerate() {
        let floor = Duration::from_millis(20 * (i as u64 + 1));
        assert!(*at + Duration::from_millis(5) >= floor, "fire {i} at {at:?}");
    }
    assert!(fires[4] < Duration::from_secs(2), "{:?}", fires[4]);
}

#[test]
fn hooked_sleep_lets_other_fibers_run() {
    let iom = IoManager::new(1, false, "scenario-sleep").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    iom.schedule_fn(move || {
        hook::usleep(50_000);
        o.lock().unwrap().push("sleeper");
    });
    let o = Arc::clone(&order);
    iom.schedule_fn(move || o.lock().unwrap().push("runner"));

    drop(iom);
    assert_eq!(*order.lock().unwrap(), vec!["runner", "sleeper"]);
}
