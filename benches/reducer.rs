//! Reducer and derived-state benchmarks
//!
//! Measures full replay cost at various log lengths, and the memoized
//! recompute path that callers hit on every render.
//!
//! Run with: cargo bench --bench reducer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossword_sync::event::{
    Coord, CreateParams, Event, EventKind, PuzzleDocument, UpdateCellParams, UpdateCursorParams,
};
use crossword_sync::game::replay;
use rand::Rng;

const SIZE: usize = 15;

fn puzzle() -> PuzzleDocument {
    let rows: Vec<String> = (0..SIZE)
        .map(|r| {
            (0..SIZE)
                .map(|c| if (r + c) % 7 == 0 { '.' } else { (b'A' + ((r * SIZE + c) % 26) as u8) as char })
                .collect()
        })
        .collect();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    PuzzleDocument::from_rows(&rows)
}

/// Create event plus `count` random edits and cursor moves
fn create_log(count: usize) -> (Event, Vec<Event>) {
    let create = Event::new(
        EventKind::Create(CreateParams {
            pid: "bench".to_string(),
            puzzle: puzzle(),
        }),
        Some("host".to_string()),
        0,
    );

    let mut rng = rand::thread_rng();
    let events = (0..count)
        .map(|i| {
            let cell = Coord::new(rng.gen_range(0..SIZE), rng.gen_range(0..SIZE));
            let user = format!("user{}", i % 4);
            let kind = if i % 3 == 0 {
                EventKind::UpdateCursor(UpdateCursorParams {
                    id: user.clone(),
                    cell,
                })
            } else {
                EventKind::UpdateCell(UpdateCellParams {
                    cell,
                    value: ((b'A' + rng.gen_range(0..26u8)) as char).to_string(),
                    pencil: rng.gen_bool(0.1),
                    autocheck: false,
                })
            };
            Event::new(kind, Some(user), i as i64 + 1)
        })
        .collect();

    (create, events)
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(50);

    for count in [100, 1_000, 10_000] {
        let (create, events) = create_log(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(replay(Some(&create), events.iter())))
        });
    }

    group.finish();
}

fn bench_memoized_recompute(c: &mut Criterion) {
    use crossword_sync::cache::{EntityCache, EntityPath};
    use crossword_sync::config::CacheConfig;
    use crossword_sync::metrics::Metrics;
    use crossword_sync::net::{LocalChannel, SyncHub};
    use crossword_sync::store::InMemoryEventLog;
    use crossword_sync::util::clock::SystemTimeSource;
    use std::sync::Arc;

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (cache, path) = runtime.block_on(async {
        let time = Arc::new(SystemTimeSource);
        let log = Arc::new(InMemoryEventLog::new(time.clone()));
        let hub = SyncHub::start(log, 4096, Arc::new(Metrics::new()));
        let cache = EntityCache::new(
            CacheConfig::default(),
            Arc::new(LocalChannel::new(hub)),
            time,
            "bench",
        );

        let path = EntityPath::game("bench").unwrap();
        cache.attach(&path).await.unwrap();
        let (create, events) = create_log(1_000);
        if let EventKind::Create(params) = create.kind {
            cache.create(&path, &params.pid, params.puzzle).unwrap().await.unwrap();
        }
        for event in events {
            if let EventKind::UpdateCell(p) = event.kind {
                if let Some(submission) = cache.update_cell(&path, p.cell, &p.value, p.pencil, false) {
                    let _ = submission.await;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (cache, path)
    });

    c.bench_function("recompute_memoized", |b| {
        b.iter(|| black_box(cache.compute_game_state(&path)))
    });
}

criterion_group!(benches, bench_replay, bench_memoized_recompute);
criterion_main!(benches);
