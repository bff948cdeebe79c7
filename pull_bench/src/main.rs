use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use fifo::{FifoConfig, FifoError, Queue};

const END_MARKER: u64 = u64::MAX;
const SEQUENCE_SIZE: usize = 8;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fifo-bench.toml")]
    config: String,
    /// How long to wait for push_bench to create the segment.
    #[clap(long = "attach-timeout-ms", default_value = "10000")]
    attach_timeout_ms: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    fifo: FifoConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    let name = cfg
        .fifo
        .shared_name
        .ok_or("pull_bench needs `fifo.shared_name` to attach to")?;

    let queue = Arc::new(attach(&name, Duration::from_millis(opts.attach_timeout_ms))?);
    info!("attached to `{}` ({} bytes)", name, queue.capacity());

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

    let result = run(&queue);

    signal_handle.close();
    let _ = watcher.join();
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.close();
    }
    result
}

/// Retries until the creator has published the segment header.
fn attach(name: &str, timeout: Duration) -> Result<Queue, FifoError> {
    let deadline = Instant::now() + timeout;
    loop {
        match Queue::open_existing(name) {
            Ok(queue) => return Ok(queue),
            Err(e @ FifoError::NotFound(_)) | Err(e @ FifoError::Configuration(_)) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                debug!("`{}` not ready yet: {}", name, e);
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e),
        }
    }
}

fn run(queue: &Queue) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut called = 0u64;
    loop {
        let frame = match queue.pull(None) {
            Ok((frame, _)) => frame,
            Err(FifoError::Eof) | Err(FifoError::WouldBlock) => {
                warn!("interrupted after {} frames", called);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if frame.len() < SEQUENCE_SIZE {
            return Err(format!("frame {} is only {} bytes", called, frame.len()).into());
        }
        let mut raw = [0u8; SEQUENCE_SIZE];
        raw.copy_from_slice(&frame[..SEQUENCE_SIZE]);
        let sequence = u64::from_le_bytes(raw);
        if sequence == END_MARKER {
            println!("\nFinished after {} frames", called);
            break;
        }
        if sequence != called {
            return Err(format!("expected frame {} but got {}", called, sequence).into());
        }
        if called % 500_000 == 0 {
            eprint!("\rTotal {} ops (current value: {})", called, sequence);
        }
        called += 1;
    }
    let duration = start.elapsed();
    let iops = ((called as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages pull/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
