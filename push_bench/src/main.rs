use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use fifo::{FifoConfig, FifoError, Queue};

/// Sequence number of the frame that ends a run.
const END_MARKER: u64 = u64::MAX;
const SEQUENCE_SIZE: usize = 8;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fifo-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "1000000")]
    messages: u64,
    /// Frame size in bytes, sequence number included.
    #[clap(short = 's', long = "size", default_value = "64")]
    size: usize,
    /// How long to wait for pull_bench to drain the queue before unlinking it.
    #[clap(long = "drain-timeout-ms", default_value = "30000")]
    drain_timeout_ms: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    fifo: FifoConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    cfg.fifo.validate()?;
    if cfg.fifo.shared_name.is_none() {
        return Err("push_bench needs `fifo.shared_name` so pull_bench can attach".into());
    }
    if opts.size < SEQUENCE_SIZE {
        return Err(format!("--size must be at least {}", SEQUENCE_SIZE).into());
    }
    info!("{:?}", cfg.fifo);

    let queue = Arc::new(Queue::from_config(&cfg.fifo)?);
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    let signal_handle = signals.handle();
    let watcher = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!("signal {} received, releasing blocked operations", signal);
                if let Err(e) = queue.set_blocking(false) {
                    warn!("cannot switch queue to non-blocking: {}", e);
                }
            }
        })
    };

    let result = run(&queue, &opts);

    signal_handle.close();
    let _ = watcher.join();
    match Arc::try_unwrap(queue) {
        Ok(queue) => queue.close(),
        Err(_) => warn!("queue still shared at exit, leaving it to drop"),
    }
    result
}

fn run(queue: &Queue, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut frame = vec![0u8; opts.size];
    let mut called = 0u64;

    while called < opts.messages {
        frame[..SEQUENCE_SIZE].copy_from_slice(&called.to_le_bytes());
        match queue.push(&frame) {
            Ok(()) => {}
            Err(FifoError::WouldBlock) => {
                warn!("interrupted after {} frames", called);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        if called % 500_000 == 0 {
            eprint!("\rTotal {} ops (level: {})", called, queue.level()?);
        }
        called += 1;
    }
    queue.push(&END_MARKER.to_le_bytes())?;

    let duration = start.elapsed();
    let iops = ((called as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages push/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );

    // The segment goes away with us; let the puller drain it first.
    wait_for_drain(queue, Duration::from_millis(opts.drain_timeout_ms))
}

/// Waits until the queue is empty, it was switched to non-blocking, or
/// `timeout` passed.
fn wait_for_drain(queue: &Queue, timeout: Duration) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + timeout;
    while queue.level()? > 0 && queue.is_blocking()? {
        if Instant::now() >= deadline {
            return Err(format!(
                "queue still holds {} bytes after {:?}, is pull_bench running?",
                queue.level()?,
                timeout
            )
            .into());
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
