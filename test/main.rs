use std::thread;
use std::time::Duration;

use fifo::{FifoConfig, FifoError, Queue};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting fifo queue simulation...");

    let name = format!("/fifo-simulation-{}", std::process::id());
    let config = FifoConfig::builder()
        .capacity(256)
        .blocking(true)
        .shared_name(name.clone())
        .build()?;

    let producer_queue = Queue::from_config(&config)?;
    let consumer_queue = Queue::open_existing(&name)?;

    let messages_to_send = vec![
        "Hello from fifo!".to_string(),
        "This is a test message.".to_string(),
        " trzecia wiadomosc po polsku ".to_string(),
        "Short".to_string(),
        "A bit longer message that forces the ring to wrap more often.".to_string(),
    ];
    let rounds = 50;

    let producer = {
        let messages_to_send = messages_to_send.clone();
        thread::spawn(move || -> Result<Queue, FifoError> {
            for round in 0..rounds {
                for msg in &messages_to_send {
                    producer_queue.push(format!("{}:{}", round, msg).as_bytes())?;
                }
            }
            Ok(producer_queue)
        })
    };

    let mut all_match = true;
    let mut received_count = 0;
    for round in 0..rounds {
        for expected in &messages_to_send {
            let expected = format!("{}:{}", round, expected);
            match consumer_queue.pull(Some(Duration::from_secs(5))) {
                Ok((data, _)) => {
                    let received = String::from_utf8(data)?;
                    if received != expected {
                        eprintln!("[Consumer] Mismatch! Expected '{}', Got '{}'", expected, received);
                        all_match = false;
                    }
                    received_count += 1;
                }
                Err(e) => {
                    eprintln!("[Consumer] Error pulling message {}: {}", received_count, e);
                    all_match = false;
                }
            }
        }
    }

    let producer_queue = producer.join().map_err(|_| "producer panicked")??;
    println!("[Main] level after drain: {}", consumer_queue.level()?);
    consumer_queue.close();
    producer_queue.close();

    if all_match && received_count == rounds * messages_to_send.len() {
        println!("\nSimulation successful! All {} messages sent and received in order.", received_count);
        Ok(())
    } else {
        eprintln!("\nSimulation failed. Some messages were not received correctly.");
        Err("Simulation failed".into())
    }
}
