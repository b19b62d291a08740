//! Benchmarks for the session composition hot path: one `Session::tick`
//! call with a populated timer wheel, and one `SenderEngine::serve` call
//! draining a large open object (`SPEC_FULL.md` §4.7).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quanta::Instant;

use norm_engine::config::SessionConfig;
use norm_engine::gf::FecScheme;
use norm_engine::object::{Backing, DataStore, Geometry};
use norm_engine::sender::{ObjectSpec, SenderEngine};
use norm_engine::session::Session;

fn config() -> SessionConfig {
    let mut c = SessionConfig::default();
    c.ndata = 64;
    c.nparity = 16;
    c.segment_size = 1024;
    c
}

fn bench_session_tick(c: &mut Criterion) {
    let cfg = config();
    let mut session = Session::new(cfg, 1, Instant::now());
    session.schedule_user_timer(Instant::now(), std::time::Duration::from_millis(1));
    c.bench_function("session_tick_idle", |b| {
        b.iter(|| {
            session.tick(black_box(Instant::now())).unwrap();
            session.drain_events().for_each(drop);
            session.drain_outbound();
        });
    });
}

fn bench_sender_serve(c: &mut Criterion) {
    let cfg = config();
    c.bench_function("sender_serve_one_symbol", |b| {
        let mut tx = SenderEngine::new(cfg.clone(), 1, Instant::now());
        let geometry = Geometry {
            fec_scheme: FecScheme::Rs8,
            seg_size: cfg.segment_size,
            ndata: cfg.ndata,
            nparity: cfg.nparity,
            object_size: cfg.ndata as u64 * cfg.segment_size as u64 * 64,
        };
        let data = vec![0u8; geometry.object_size as usize];
        tx.open_object(ObjectSpec { object_id: 1, geometry, info: None, backing: Backing::Data(DataStore::from_slice(&data)) }).unwrap();
        b.iter(|| {
            if !tx.serve().unwrap() {
                tx.open_object(ObjectSpec {
                    object_id: 2,
                    geometry,
                    info: None,
                    backing: Backing::Data(DataStore::from_slice(&data)),
                })
                .unwrap();
            }
            tx.drain_output().for_each(drop);
        });
    });
}

criterion_group!(benches, bench_session_tick, bench_sender_serve);
criterion_main!(benches);
