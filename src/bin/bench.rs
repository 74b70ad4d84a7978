//! Benchmark harness for the queue implementations.
//!
//! Drives P producers against C consumers for a warmup window followed by a
//! measured window, then reports throughput, end-to-end element latency
//! percentiles, the deepest backlog observed, and peak resident memory —
//! either as a human-readable summary or as a CSV row appended to a file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use crossbeam_utils::sync::WaitGroup;

use reclaim_queue::reclaim::{Epoch, Hazard, Leak, Reclaim};
use reclaim_queue::{MpmcQueue, MutexQueue, PushError};

const CSV_HEADER: &str = "impl,P,C,payload_us,throughput_prod,throughput_cons,avg_lat,p50,p99,p999,max_lat,max_depth,peak_mem_kb";

/// Latency samples kept per consumer; beyond this the tail of the run is
/// represented by the samples already taken.
const SAMPLE_CAP: usize = 1 << 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Impl {
    /// Lock-free queue with hazard-pointer reclamation.
    Hp,
    /// Lock-free queue with epoch-based reclamation.
    Ebr,
    /// Lock-free queue that never reclaims (leaking baseline).
    None,
    /// Coarse-grained mutex queue.
    Mutex,
}

impl Impl {
    fn tag(self) -> &'static str {
        match self {
            Impl::Hp => "hp",
            Impl::Ebr => "ebr",
            Impl::None => "none",
            Impl::Mutex => "mutex",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "bench-queue")]
#[command(about = "MPMC queue benchmark harness")]
struct Args {
    /// Queue implementation to benchmark.
    #[arg(long = "impl", value_enum, default_value = "hp")]
    queue_impl: Impl,

    /// Number of producer threads.
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Number of consumer threads.
    #[arg(long, default_value_t = 4)]
    consumers: usize,

    /// Busy-work microseconds around each operation.
    #[arg(long = "payload-us", default_value_t = 0)]
    payload_us: u64,

    /// Warmup seconds excluded from measurement.
    #[arg(long, default_value_t = 2)]
    warmup: u64,

    /// Measured seconds.
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Append a CSV row to this file instead of printing a summary.
    #[arg(long)]
    csv: Option<PathBuf>,
}

/// What flows through the queue: producer identity, per-producer sequence
/// number, and the enqueue instant for end-to-end latency.
struct Item {
    #[allow(dead_code)]
    producer: u32,
    #[allow(dead_code)]
    seq: u64,
    enqueued_at: Instant,
}

/// The slice of the queue surface the harness needs, so one driver covers
/// both the lock-free variants and the mutex baseline.
trait BenchQueue: Send + Sync + Default + 'static {
    fn push(&self, item: Item) -> Result<(), PushError<Item>>;
    fn pop(&self) -> Option<Item>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn quiescent(&self);
}

impl<R: Reclaim> BenchQueue for MpmcQueue<Item, R> {
    fn push(&self, item: Item) -> Result<(), PushError<Item>> {
        MpmcQueue::push(self, item)
    }
    fn pop(&self) -> Option<Item> {
        MpmcQueue::pop(self)
    }
    fn close(&self) {
        MpmcQueue::close(self)
    }
    fn is_closed(&self) -> bool {
        MpmcQueue::is_closed(self)
    }
    fn quiescent(&self) {
        MpmcQueue::quiescent(self)
    }
}

impl BenchQueue for MutexQueue<Item> {
    fn push(&self, item: Item) -> Result<(), PushError<Item>> {
        MutexQueue::push(self, item)
    }
    fn pop(&self) -> Option<Item> {
        MutexQueue::pop(self)
    }
    fn close(&self) {
        MutexQueue::close(self)
    }
    fn is_closed(&self) -> bool {
        MutexQueue::is_closed(self)
    }
    fn quiescent(&self) {}
}

/// Busy-waits instead of sleeping: at microsecond scale the scheduler's
/// wakeup latency would dwarf the payload itself.
fn payload(us: u64) {
    if us == 0 {
        return;
    }
    let deadline = Instant::now() + Duration::from_micros(us);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

struct Report {
    throughput_prod: f64,
    throughput_cons: f64,
    avg_lat: u64,
    p50: u64,
    p99: u64,
    p999: u64,
    max_lat: u64,
    max_depth: i64,
    peak_mem_kb: u64,
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank]
}

fn peak_rss_kb() -> u64 {
    // SAFETY: getrusage only writes into the struct we hand it.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            // Linux reports ru_maxrss in kilobytes.
            usage.ru_maxrss as u64
        } else {
            0
        }
    }
}

fn run<Q: BenchQueue>(args: &Args) -> Report {
    let queue = Arc::new(Q::default());
    let stop = Arc::new(AtomicBool::new(false));
    let measuring = Arc::new(AtomicBool::new(false));
    let enq_ok = Arc::new(AtomicU64::new(0));
    let deq_ok = Arc::new(AtomicU64::new(0));
    let depth = Arc::new(AtomicI64::new(0));
    let max_depth = Arc::new(AtomicI64::new(0));

    let start_gate = WaitGroup::new();

    let mut producers = Vec::with_capacity(args.producers);
    for p in 0..args.producers {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        let enq_ok = Arc::clone(&enq_ok);
        let depth = Arc::clone(&depth);
        let max_depth = Arc::clone(&max_depth);
        let gate = start_gate.clone();
        let payload_us = args.payload_us;
        producers.push(thread::spawn(move || {
            gate.wait();
            let mut seq = 0u64;
            while !stop.load(Ordering::Relaxed) {
                payload(payload_us);
                let item = Item {
                    producer: p as u32,
                    seq,
                    enqueued_at: Instant::now(),
                };
                if queue.push(item).is_err() {
                    break;
                }
                seq += 1;
                enq_ok.fetch_add(1, Ordering::Relaxed);
                let d = depth.fetch_add(1, Ordering::Relaxed) + 1;
                max_depth.fetch_max(d, Ordering::Relaxed);
            }
            queue.quiescent();
        }));
    }

    let mut consumers = Vec::with_capacity(args.consumers);
    for _ in 0..args.consumers {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        let measuring = Arc::clone(&measuring);
        let deq_ok = Arc::clone(&deq_ok);
        let depth = Arc::clone(&depth);
        let gate = start_gate.clone();
        let payload_us = args.payload_us;
        consumers.push(thread::spawn(move || {
            gate.wait();
            let mut samples = Vec::new();
            loop {
                match queue.pop() {
                    Some(item) => {
                        deq_ok.fetch_add(1, Ordering::Relaxed);
                        depth.fetch_sub(1, Ordering::Relaxed);
                        if measuring.load(Ordering::Relaxed) && samples.len() < SAMPLE_CAP {
                            samples.push(item.enqueued_at.elapsed().as_nanos() as u64);
                        }
                        payload(payload_us);
                    }
                    None => {
                        // Drain past `stop` until the close is visible and
                        // the queue stays empty.
                        if stop.load(Ordering::Relaxed) && queue.is_closed() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            queue.quiescent();
            samples
        }));
    }

    start_gate.wait();
    thread::sleep(Duration::from_secs(args.warmup));

    let enq0 = enq_ok.load(Ordering::Relaxed);
    let deq0 = deq_ok.load(Ordering::Relaxed);
    measuring.store(true, Ordering::Relaxed);
    let t0 = Instant::now();
    thread::sleep(Duration::from_secs(args.duration));
    let elapsed = t0.elapsed().as_secs_f64();
    measuring.store(false, Ordering::Relaxed);
    let enq1 = enq_ok.load(Ordering::Relaxed);
    let deq1 = deq_ok.load(Ordering::Relaxed);

    stop.store(true, Ordering::Relaxed);
    queue.close();

    for handle in producers {
        handle.join().expect("producer panicked");
    }
    let mut samples: Vec<u64> = Vec::new();
    for handle in consumers {
        samples.extend(handle.join().expect("consumer panicked"));
    }
    samples.sort_unstable();

    let avg = if samples.is_empty() {
        0
    } else {
        samples.iter().sum::<u64>() / samples.len() as u64
    };

    Report {
        throughput_prod: (enq1 - enq0) as f64 / elapsed,
        throughput_cons: (deq1 - deq0) as f64 / elapsed,
        avg_lat: avg,
        p50: percentile(&samples, 0.50),
        p99: percentile(&samples, 0.99),
        p999: percentile(&samples, 0.999),
        max_lat: samples.last().copied().unwrap_or(0),
        max_depth: max_depth.load(Ordering::Relaxed),
        peak_mem_kb: peak_rss_kb(),
    }
}

fn emit(args: &Args, report: &Report) -> std::io::Result<()> {
    let row = format!(
        "{},{},{},{},{:.0},{:.0},{},{},{},{},{},{},{}",
        args.queue_impl.tag(),
        args.producers,
        args.consumers,
        args.payload_us,
        report.throughput_prod,
        report.throughput_cons,
        report.avg_lat,
        report.p50,
        report.p99,
        report.p999,
        report.max_lat,
        report.max_depth,
        report.peak_mem_kb,
    );

    match &args.csv {
        Some(path) => {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            if file.metadata()?.len() == 0 {
                writeln!(file, "{}", CSV_HEADER)?;
            }
            writeln!(file, "{}", row)?;
            println!("wrote {}", path.display());
        }
        None => {
            println!(
                "impl={} P={} C={} payload_us={}",
                args.queue_impl.tag(),
                args.producers,
                args.consumers,
                args.payload_us
            );
            println!(
                "throughput: {:.0} enq/s, {:.0} deq/s",
                report.throughput_prod, report.throughput_cons
            );
            println!(
                "latency ns: avg={} p50={} p99={} p999={} max={}",
                report.avg_lat, report.p50, report.p99, report.p999, report.max_lat
            );
            println!(
                "max_depth={} peak_mem_kb={}",
                report.max_depth, report.peak_mem_kb
            );
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let report = match args.queue_impl {
        Impl::Hp => run::<MpmcQueue<Item, Hazard>>(&args),
        Impl::Ebr => run::<MpmcQueue<Item, Epoch>>(&args),
        Impl::None => run::<MpmcQueue<Item, Leak>>(&args),
        Impl::Mutex => run::<MutexQueue<Item>>(&args),
    };

    if let Err(err) = emit(&args, &report) {
        eprintln!("failed to write results: {}", err);
        std::process::exit(1);
    }
}
