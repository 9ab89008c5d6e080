use criterion::{black_box, criterion_group, criterion_main, Criterion};
use smartmotor_link::backoff::calculate_backoff_ms;
use smartmotor_link::config::{FilterConfig, ProtocolConfig};
use smartmotor_link::{
    FilterState, FrameCodec, FrameDecoder, Message, MessageKind, MessageProtocol, Payload, RateFilter,
    Role,
};

fn data_message(protocol: &MessageProtocol, sequence: u16) -> Message {
    protocol
        .build(MessageKind::Data, Payload::angle(87.5), sequence, 1_699_470_000)
        .unwrap()
}

fn benchmark_encode(c: &mut Criterion) {
    let protocol = MessageProtocol::new(ProtocolConfig::default(), Role::Controller);
    let codec = FrameCodec::new(ProtocolConfig::default().max_frame_size);
    let message = data_message(&protocol, 42);

    c.bench_function("encode_data_frame", |b| {
        b.iter(|| codec.encode(black_box(&message)))
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let protocol = MessageProtocol::new(ProtocolConfig::default(), Role::Controller);
    let codec = FrameCodec::new(ProtocolConfig::default().max_frame_size);
    let frame = codec.encode(&data_message(&protocol, 42)).unwrap();

    c.bench_function("decode_data_frame", |b| {
        b.iter(|| codec.decode(black_box(&frame)))
    });
}

fn benchmark_stream_resync(c: &mut Criterion) {
    let protocol = MessageProtocol::new(ProtocolConfig::default(), Role::Controller);
    let codec = FrameCodec::new(ProtocolConfig::default().max_frame_size);
    let mut stream = vec![0x13, 0xA5, 0x00, 0x42];
    for sequence in 1..=16 {
        stream.extend(codec.encode(&data_message(&protocol, sequence)).unwrap());
    }

    c.bench_function("decode_16_frames_after_garbage", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(codec);
            decoder.push(black_box(&stream));
            let mut frames = 0;
            while decoder.next_frame().is_some() {
                frames += 1;
            }
            frames
        })
    });
}

fn benchmark_filter(c: &mut Criterion) {
    let filter = RateFilter::new(FilterConfig::default());
    let readings: Vec<f32> = (0..64).map(|i| 90.0 + (i % 9) as f32 * 1.7).collect();

    c.bench_function("rate_filter_64_readings", |b| {
        b.iter(|| {
            let mut state = FilterState::new();
            let mut sent = 0;
            for (i, value) in readings.iter().enumerate() {
                if filter.should_send(black_box(*value), &mut state, i as u64 * 20) {
                    sent += 1;
                }
            }
            sent
        })
    });
}

fn benchmark_sequence_accept(c: &mut Criterion) {
    let sender = MessageProtocol::new(ProtocolConfig::default(), Role::Controller);
    let receiver = MessageProtocol::new(ProtocolConfig::default(), Role::Receiver);
    let messages: Vec<_> = [1u16, 2, 2, 5, 4, 6, 3000, 7]
        .iter()
        .map(|seq| data_message(&sender, *seq))
        .collect();

    c.bench_function("accept_sequence_window", |b| {
        b.iter(|| {
            let mut highest = None;
            for message in &messages {
                black_box(receiver.accept(message, &mut highest));
            }
            highest
        })
    });
}

fn benchmark_backoff(c: &mut Criterion) {
    c.bench_function("calculate_exponential_backoff", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                calculate_backoff_ms(attempt, black_box(500), black_box(10_000));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_stream_resync,
    benchmark_filter,
    benchmark_sequence_accept,
    benchmark_backoff
);
criterion_main!(benches);
