//! Command/response codec benchmarks

use bytes::BytesMut;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use csd_proto::{
    ChunkReply, Command, MemoryDescriptor, ReadCommand, Response, ReturnCode, WriteCommand,
};

fn read_command() -> Command {
    Command::read(ReadCommand {
        chunk_id: 42,
        offset: 1 << 20,
        length: 128 * 1024,
        desc: MemoryDescriptor::new(0x7f00_0000_0000, 128 * 1024, 0x2003),
    })
    .with_queue(1, 12)
}

fn bench_command(c: &mut Criterion) {
    let mut group = c.benchmark_group("command");

    let cmd = read_command();
    group.bench_function("encode_read", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            black_box(&cmd).encode(&mut buf);
            black_box(&buf);
        })
    });

    let bytes = cmd.to_bytes();
    group.bench_function("decode_read", |b| {
        b.iter(|| black_box(Command::from_bytes(black_box(&bytes))))
    });

    let inline = Command::write(WriteCommand {
        chunk_id: 42,
        offset: 0,
        length: 4096,
        inline_data_len: 4096,
        desc: MemoryDescriptor::default(),
    })
    .unwrap_or_else(|_| read_command());
    let payload = vec![0xA5u8; 4096];
    group.bench_function("encode_inline_write_4k", |b| {
        let mut buf = BytesMut::with_capacity(inline.message_len());
        b.iter(|| {
            buf.clear();
            inline.encode(&mut buf);
            buf.extend_from_slice(black_box(&payload));
            black_box(&buf);
        })
    });

    group.finish();
}

fn bench_response(c: &mut Criterion) {
    let cmd = read_command();
    let resp = Response::chunk(
        &cmd.header,
        ReturnCode::Success,
        ChunkReply {
            chunk_id: 42,
            offset: 1 << 20,
            length: 128 * 1024,
            inline_data_len: 0,
        },
    );
    let bytes = resp.to_bytes();

    c.bench_function("response_decode", |b| {
        b.iter(|| black_box(Response::from_bytes(black_box(&bytes))))
    });
}

criterion_group!(benches, bench_command, bench_response);
criterion_main!(benches);
