// cargo bench
//
// Micro benchmark of the transmit queue hot path: reserve, fill, commit and the
// consumer peek/advance pair

#![allow(unused_imports)]

use log::{debug, error, info, trace, warn};

use std::thread;

use xcp_server::queue;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

const PAYLOAD: [u8; 64] = [0x55; 64];

fn queue_benchmark(c: &mut Criterion) {
    // Producer reserve/fill/commit with an idle consumer
    {
        let (producer, mut consumer) = queue::new(1024, 256);
        c.bench_function("queue reserve_commit", |b| {
            b.iter(|| {
                let mut buf = producer.reserve(PAYLOAD.len() as u16).unwrap();
                buf.copy_from_slice(black_box(&PAYLOAD));
                buf.commit();
                // Keep the queue from filling up
                if consumer.peek_segment(usize::MAX).is_some() {
                    consumer.advance();
                }
            })
        });
    }

    // Producer and consumer on separate threads
    {
        let (producer, mut consumer) = queue::new(1024, 256);
        let drain = thread::spawn(move || {
            loop {
                if consumer.wait_for_data(std::time::Duration::from_millis(10)) {
                    while let Some(seg) = consumer.peek_segment(usize::MAX) {
                        // Scan the segment for the 1 byte stop marker message
                        let mut found_stop = false;
                        let mut i = 0;
                        while i + 4 <= seg.len() {
                            let dlc = seg[i] as usize | (seg[i + 1] as usize) << 8;
                            if dlc == 1 {
                                found_stop = true;
                            }
                            i += (4 + dlc + 3) & !3;
                        }
                        consumer.advance();
                        if found_stop {
                            return;
                        }
                    }
                }
            }
        });
        c.bench_function("queue mpsc push", |b| {
            b.iter(|| {
                while !producer.push(black_box(&PAYLOAD)) {
                    thread::yield_now();
                }
            })
        });
        producer.push(&[0xAA]); // stop marker
        drain.join().unwrap();
    }
}

criterion_group!(benches, queue_benchmark);
criterion_main!(benches);
