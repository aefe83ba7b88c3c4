use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use etude_core::framing::FrameAssembler;
use etude_core::memory::Memory;
use etude_core::packet::{MAX_PACKET_LEN, encode_packet};
use etude_core::{Checksum, Crc32};

fn stream(memory: &Arc<Memory>, frames: usize, body_len: usize) -> Vec<u8> {
    let body = vec![0xA5u8; body_len];
    let mut out = Vec::with_capacity(frames * (body_len + 8));
    for i in 0..frames {
        let packet = encode_packet(memory, (i % 8) as u16, &body, &Crc32).unwrap();
        out.extend_from_slice(&packet);
    }
    out
}

fn bench_reassembly(c: &mut Criterion) {
    let memory = Memory::new();
    let bytes = stream(&memory, 1000, 100);

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    for chunk in [1usize, 8, 64, 1460] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut asm = FrameAssembler::new(Arc::clone(&memory), MAX_PACKET_LEN);
                let mut frames = 0;
                for piece in bytes.chunks(chunk) {
                    frames += asm.feed(black_box(piece)).len();
                }
                assert_eq!(frames, 1000);
            })
        });
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let body = vec![0x5Au8; 4096];
    c.bench_function("crc32_4k", |b| b.iter(|| Crc32.compute(black_box(&body))));
}

criterion_group!(benches, bench_reassembly, bench_checksum);
criterion_main!(benches);
