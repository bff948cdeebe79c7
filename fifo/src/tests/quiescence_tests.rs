use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::init_logging;
use crate::{
    FifoError, FrameProcessor, FrameSink, ProcessorFactory, Stage, StageConfig, StageError, StageKind,
    StageSettings,
};

/// Prefixes every frame with the `generation` setting and fails on frames
/// that read `fail`.
struct StampProcessor {
    generation: u8,
}

impl FrameProcessor for StampProcessor {
    fn kind(&self) -> StageKind {
        StageKind::Transcoder
    }

    fn process(&mut self, frame: &[u8], sink: &mut FrameSink<'_>) -> Result<(), StageError> {
        if frame == b"fail" {
            return Err(StageError::Processor("refusing frame".to_string()));
        }
        let mut stamped = Vec::with_capacity(frame.len() + 1);
        stamped.push(self.generation);
        stamped.extend_from_slice(frame);
        sink(&stamped[..])?;
        Ok(())
    }
}

/// Records the queue levels it sees whenever a processor is opened.
#[derive(Default)]
struct StampFactory {
    stage: Mutex<Weak<Stage>>,
    levels_at_open: Mutex<Vec<(usize, usize)>>,
    opened: AtomicU64,
}

impl StampFactory {
    fn watch(&self, stage: &Arc<Stage>) {
        *self.stage.lock().unwrap() = Arc::downgrade(stage);
    }
}

impl ProcessorFactory for StampFactory {
    fn kind(&self) -> StageKind {
        StageKind::Transcoder
    }

    fn open(&self, settings: &StageSettings) -> Result<Box<dyn FrameProcessor>, StageError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(stage) = self.stage.lock().unwrap().upgrade() {
            let levels = (stage.input_level()?, stage.output_level()?);
            self.levels_at_open.lock().unwrap().push(levels);
        }
        let generation = settings.parse::<u8>("generation")?.unwrap_or(0);
        Ok(Box::new(StampProcessor { generation }))
    }
}

fn config(name: &str, output_capacity: usize) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        input_capacity: 4096,
        output_capacity,
        poll_interval_ms: 5,
        join_timeout_ms: 5_000,
    }
}

fn generation(value: u8) -> StageSettings {
    StageSettings::new().with("generation", value.to_string())
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn reconfigure_discards_queued_frames_and_restarts_processor() -> Result<(), StageError> {
    init_logging();
    let factory = Arc::new(StampFactory::default());
    // 16 byte frames come out as 25 stored bytes: two fit, the third blocks
    // the worker on a full output queue.
    let stage = Arc::new(Stage::open(&config("stamp", 64), factory.clone(), generation(1))?);
    factory.watch(&stage);

    for i in 0..10u8 {
        stage.send(&[i; 16])?;
    }
    wait_until("worker to block on output", || {
        stage.output_level().unwrap() == 50 && stage.input_level().unwrap() == 7 * 24
    });

    assert!(stage.set_settings(generation(2))?);
    assert_eq!(*factory.levels_at_open.lock().unwrap(), vec![(0, 0)]);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    assert_eq!(stage.input_level()?, 0);
    assert_eq!(stage.output_level()?, 0);
    assert!(stage.is_valid());

    stage.send(b"fresh frame")?;
    let received = stage.receive(Some(Duration::from_secs(2)))?;
    assert_eq!(received[0], 2);
    assert_eq!(&received[1..], b"fresh frame");
    assert!(matches!(
        stage.receive(Some(Duration::from_millis(50))),
        Err(FifoError::TimedOut)
    ));
    Ok(())
}

#[test]
fn generations_never_interleave_under_traffic() -> Result<(), StageError> {
    let factory = Arc::new(StampFactory::default());
    let stage = Arc::new(Stage::open(&config("traffic", 1024), factory, generation(0))?);
    let producing = Arc::new(AtomicBool::new(true));
    let consuming = Arc::new(AtomicBool::new(true));

    let producer = {
        let stage = Arc::clone(&stage);
        let producing = Arc::clone(&producing);
        thread::spawn(move || {
            let mut sequence = 0u64;
            while producing.load(Ordering::SeqCst) {
                match stage.send(&sequence.to_le_bytes()) {
                    Ok(()) | Err(FifoError::WouldBlock) => {}
                    Err(e) => panic!("send failed: {}", e),
                }
                sequence += 1;
            }
        })
    };
    let consumer = {
        let stage = Arc::clone(&stage);
        let consuming = Arc::clone(&consuming);
        thread::spawn(move || {
            let mut seen = Vec::new();
            while consuming.load(Ordering::SeqCst) {
                match stage.receive(Some(Duration::from_millis(10))) {
                    Ok(frame) => seen.push(frame[0]),
                    Err(FifoError::TimedOut) | Err(FifoError::WouldBlock) | Err(FifoError::Eof) => {}
                    Err(e) => panic!("receive failed: {}", e),
                }
            }
            seen
        })
    };

    for round in 1..=5u8 {
        thread::sleep(Duration::from_millis(20));
        assert!(stage.set_settings(generation(round))?);
    }
    thread::sleep(Duration::from_millis(20));
    // The consumer keeps draining until the producer is out of `send`.
    producing.store(false, Ordering::SeqCst);
    producer.join().expect("producer panicked");
    consuming.store(false, Ordering::SeqCst);
    let seen = consumer.join().expect("consumer panicked");

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "generations went backwards");
    assert!(stage.is_valid());

    // Flushes whatever the consumer left behind.
    assert!(stage.set_settings(generation(6))?);
    stage.send(b"last")?;
    assert_eq!(stage.receive(Some(Duration::from_secs(2)))?, b"\x06last");
    Ok(())
}

#[test]
fn concurrent_reconfigurations_all_complete() -> Result<(), StageError> {
    let factory = Arc::new(StampFactory::default());
    let stage = Arc::new(Stage::open(&config("racing", 1024), factory.clone(), generation(0))?);

    let callers: Vec<_> = (1..=4u8)
        .map(|g| {
            let stage = Arc::clone(&stage);
            thread::spawn(move || stage.set_settings(generation(g)))
        })
        .collect();
    for caller in callers {
        caller.join().expect("reconfiguring thread panicked")?;
    }

    assert!(stage.is_valid());
    assert_eq!(factory.opened.load(Ordering::SeqCst), 5);
    let current = stage.settings().parse::<u8>("generation")?.unwrap_or(0);
    stage.send(b"check")?;
    let frame = stage.receive(Some(Duration::from_secs(2)))?;
    assert_eq!(frame[0], current);
    Ok(())
}

#[test]
fn parked_receive_is_released_by_reconfiguration() -> Result<(), StageError> {
    let stage = Arc::new(Stage::open(&config("parked", 1024), Arc::new(StampFactory::default()), generation(0))?);

    let started = Instant::now();
    let receiver = {
        let stage = Arc::clone(&stage);
        thread::spawn(move || stage.receive(Some(Duration::from_secs(10))))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(stage.set_settings(generation(1))?);

    let result = receiver.join().expect("receiver panicked");
    assert!(matches!(result, Err(FifoError::Eof)), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn failed_worker_invalidates_stage() -> Result<(), StageError> {
    let stage = Stage::open(&config("failing", 1024), Arc::new(StampFactory::default()), generation(0))?;
    stage.send(b"fail")?;
    // The failing frame is consumed and the worker ends.
    wait_until("worker to take the frame", || stage.input_level().unwrap() == 0);
    thread::sleep(Duration::from_millis(20));

    let err = stage.set_settings(generation(1)).unwrap_err();
    assert!(matches!(err, StageError::WorkerFailed(_)), "{}", err);
    assert!(!stage.is_valid());

    let err = stage.set_settings(generation(2)).unwrap_err();
    assert!(matches!(err, StageError::NotRunning(_)), "{}", err);

    // Queues are usable again even without a worker.
    stage.send(b"orphan")?;
    assert_eq!(stage.input_level()?, 8 + 6);
    stage.close()
}
