use std::hint::black_box;

use chrono::Utc;
use concert_sync::broadcast::{Delivery, DeliveryQueue};
use concert_sync::config::LogConfig;
use concert_sync::event::{EventKind, EventPayload, PendingEvent, SessionEvent};
use concert_sync::protocol::SessionMessage;
use concert_sync::storage::record::{decode_record, encode_record};
use concert_sync::storage::EventLog;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;
use uuid::Uuid;

fn sample_event(sequence: u64, size: usize) -> SessionEvent {
    SessionEvent {
        sequence,
        origin_endpoint_id: Uuid::new_v4(),
        submission_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        kind: EventKind::Transaction,
        package: None,
        payload: EventPayload::Inline(vec![0u8; size]),
    }
}

fn bench_event_message_encode(c: &mut Criterion) {
    let event = sample_event(1, 256);
    let endpoint = Uuid::new_v4();
    let session = Uuid::new_v4();

    c.bench_function("event_message_encode_256B", |b| {
        b.iter(|| {
            let msg = SessionMessage::event(black_box(endpoint), black_box(session), black_box(&event)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_event_message_decode(c: &mut Criterion) {
    let event = sample_event(1, 256);
    let encoded = SessionMessage::event(Uuid::new_v4(), Uuid::new_v4(), &event)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("event_message_decode_256B", |b| {
        b.iter(|| {
            let msg = SessionMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.session_event().unwrap());
        })
    });
}

fn bench_record_codec(c: &mut Criterion) {
    let small = sample_event(1, 64);
    let large = sample_event(2, 16 * 1024);
    let threshold = LogConfig::default().compress_threshold;

    c.bench_function("record_encode_64B", |b| {
        b.iter(|| black_box(encode_record(black_box(&small), threshold).unwrap()))
    });

    c.bench_function("record_encode_16KB_compressed", |b| {
        b.iter(|| black_box(encode_record(black_box(&large), threshold).unwrap()))
    });

    let framed = encode_record(&large, threshold).unwrap();
    c.bench_function("record_decode_16KB_compressed", |b| {
        b.iter(|| black_box(decode_record(black_box(&framed)).unwrap()))
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = LogConfig {
        sync_writes: false,
        ..LogConfig::default()
    };
    let mut log = EventLog::open(dir.path().join("events"), config).unwrap();
    let origin = Uuid::new_v4();

    c.bench_function("log_append_256B", |b| {
        b.iter(|| {
            let pending = PendingEvent::transaction(origin, vec![0u8; 256]);
            black_box(log.append(pending, Utc::now()).unwrap());
        })
    });
}

fn bench_log_replay(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = LogConfig {
        sync_writes: false,
        ..LogConfig::default()
    };
    let mut log = EventLog::open(dir.path().join("events"), config).unwrap();
    let origin = Uuid::new_v4();
    for _ in 0..1000 {
        log.append(PendingEvent::transaction(origin, vec![0u8; 256]), Utc::now())
            .unwrap();
    }

    c.bench_function("log_replay_1000x256B", |b| {
        b.iter(|| {
            let count = log.read_from(black_box(1)).unwrap().filter(Result::is_ok).count();
            black_box(count);
        })
    });

    c.bench_function("log_replay_last_100", |b| {
        b.iter(|| {
            let count = log.read_from(black_box(901)).unwrap().filter(Result::is_ok).count();
            black_box(count);
        })
    });
}

fn bench_delivery_handoff(c: &mut Criterion) {
    let events: Vec<SessionEvent> = (1..=200).map(|seq| sample_event(seq, 32)).collect();

    // Live events 101..=200 arrive while history 1..=100 is still replaying
    c.bench_function("delivery_queue_interleaved_200", |b| {
        b.iter_batched(
            || DeliveryQueue::new(1, 100),
            |mut queue| {
                let (history, live) = events.split_at(100);
                for (replayed, live) in history.iter().zip(live) {
                    black_box(queue.offer(Delivery::Live(live.clone())));
                    black_box(queue.offer(Delivery::Replay(replayed.clone())));
                }
                black_box(queue.buffered());
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_event_message_encode,
    bench_event_message_decode,
    bench_record_codec,
    bench_log_append,
    bench_log_replay,
    bench_delivery_handoff,
);

criterion_main!(benches);
