use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fieldgate::buffer::{EventBuffer, EventCandidate};
use fieldgate::format::{NumberFormat, NumberFormatter};

fn bench_convert(c: &mut Criterion) {
    let mut formatter = NumberFormatter::new();
    formatter.set_format("fixed", NumberFormat::Fixed(2));
    formatter.set_format("precision", NumberFormat::Precision(3));

    c.bench_function("convert_plain", |b| {
        b.iter(|| formatter.convert(black_box("plain"), black_box(1234.4321)))
    });

    c.bench_function("convert_fixed", |b| {
        b.iter(|| formatter.convert(black_box("fixed"), black_box(1234.4321)))
    });

    c.bench_function("convert_precision", |b| {
        b.iter(|| formatter.convert(black_box("precision"), black_box(1234.4321)))
    });
}

fn bench_event_window(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let dir = tempfile::tempdir().expect("tempdir");

    const WINDOW: usize = 64;

    // A fully deduplicated window: the worst case scans every candidate
    // against the full buffer without persisting.
    let mut buffer = rt
        .block_on(EventBuffer::open(dir.path().join("events.json"), WINDOW))
        .expect("open");

    let window: Vec<EventCandidate> = (0..WINDOW as u64)
        .rev()
        .map(|tick_id| EventCandidate {
            tick_id,
            value: (tick_id % 7) as f64,
        })
        .collect();

    rt.block_on(buffer.refresh_events(&window)).expect("seed");

    c.bench_function("refresh_events_all_duplicates", |b| {
        b.iter(|| {
            rt.block_on(buffer.refresh_events(black_box(&window)))
                .expect("refresh")
        })
    });
}

criterion_group!(benches, bench_convert, bench_event_window);
criterion_main!(benches);
