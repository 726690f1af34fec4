use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gdbridge_core::protocol::{checksum, escape, unescape, Command, Frame};
use gdbridge_core::xfer::read_window;
use gdbridge_core::protocol::XferWindow;
use gdbridge_core::target::CORTEX_M_TARGET_XML;

/// A flash write payload with every byte value, so escaping has work to do.
fn flash_chunk() -> Vec<u8> {
    (0..2048u32).map(|i| (i % 256) as u8).collect()
}

fn bench_checksum(c: &mut Criterion) {
    let data = flash_chunk();
    c.bench_function("checksum_2k", |b| {
        b.iter(|| black_box(checksum(black_box(&data))));
    });
}

fn bench_escape_round_trip(c: &mut Criterion) {
    let data = flash_chunk();
    let escaped = escape(&data);
    c.bench_function("escape_2k", |b| {
        b.iter(|| black_box(escape(black_box(&data))));
    });
    c.bench_function("unescape_2k", |b| {
        b.iter(|| black_box(unescape(black_box(&escaped))));
    });
}

fn bench_register_reply(c: &mut Criterion) {
    let reply = "0".repeat(8 * 17);
    c.bench_function("frame_encode_g_reply", |b| {
        b.iter(|| black_box(Frame::new(black_box(reply.as_bytes())).encode()));
    });
}

fn bench_flash_write_parse(c: &mut Criterion) {
    let mut packet = b"vFlashWrite:08000000:".to_vec();
    packet.extend_from_slice(&escape(&flash_chunk()));
    c.bench_function("parse_vflashwrite_2k", |b| {
        b.iter(|| black_box(Command::parse(black_box(&packet))));
    });
}

fn bench_target_xml_paging(c: &mut Criterion) {
    let document = CORTEX_M_TARGET_XML.as_bytes();
    c.bench_function("qxfer_target_xml_page", |b| {
        b.iter(|| {
            black_box(read_window(document, XferWindow { offset: 0x40, length: 0x7fb }, 2048))
        });
    });
}

criterion_group!(
    benches,
    bench_checksum,
    bench_escape_round_trip,
    bench_register_reply,
    bench_flash_write_parse,
    bench_target_xml_paging
);
criterion_main!(benches);
