//! Basic cofiber example
//!
//! Runs a few fibers on a plain scheduler, then a recurring timer and a
//! hooked sleep on an I/O scheduler.
//!
//! # Environment Variables
//!
//! - `COFIBER_LOG=debug` - log filter (off, error, warn, info, debug, trace)
//! - `COFIBER_STACK_SIZE=65536` - fiber stack size in bytes

use cofiber::{hook, Fiber, IoManager, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// COFIBER_LOG=debug cargo run -p cofiber-basic
fn main() -> cofiber::SchedResult<()> {
    cofiber::init_logging();
    println!("=== cofiber Basic Example ===\n");

    // Two worker threads plus the caller
    let scheduler = Scheduler::new(3, true, "basic")?;
    scheduler.start()?;

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 1..=3 {
        let c = completed.clone();
        scheduler.schedule_fn(move || {
            debug!(fiber = %Fiber::current_id(), "[fiber {}] started", i);
            for j in 0..3 {
                debug!("[fiber {}] iteration {}", i, j);
                cofiber::yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // A fiber that visits each worker thread in turn
    let hops = scheduler.thread_ids();
    let c = completed.clone();
    scheduler.schedule_fn(move || {
        for tid in hops {
            cofiber::switch_to(Some(tid));
            debug!(thread = tid, "hopped");
        }
        c.fetch_add(1, Ordering::SeqCst);
    });

    // stop() runs the caller's share of the queue and waits for the workers
    scheduler.stop();
    info!("{} fiber(s) completed", completed.load(Ordering::SeqCst));

    println!("\n--- I/O scheduler ---\n");
    let iom = IoManager::new(2, false, "basic-io")?;

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let timer = iom.add_timer(
        100,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            println!("tick {}", n);
        },
        true,
    );

    let start = Instant::now();
    iom.schedule_fn(move || {
        // Parks this fiber on a timer; the worker keeps running others
        hook::sleep(1);
        println!("slept {:?} without blocking a worker", start.elapsed());
    });

    std::thread::sleep(Duration::from_millis(550));
    timer.cancel();
    iom.stop();

    println!("\n{} ticks, {} live fibers", ticks.load(Ordering::SeqCst), Fiber::total());
    println!("\n=== Example Complete ===");
    Ok(())
}
