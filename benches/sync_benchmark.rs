use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parlor::{
    ActionPayload, ActorToken, Audience, ChangeFeed, Frame, ItemId, ItemSpec, Lww, Notice,
    Orientation, Position, RoomId, WriteStamp,
};

fn bench_action_encode(c: &mut Criterion) {
    let actor = ActorToken::generate();
    let room = RoomId::generate();
    let action = ActionPayload::MoveItem {
        item_id: ItemId::generate(),
        position: Position::new(120.0, 48.0),
        orientation: Orientation::default(),
        timestamp_ms: 1_730_000_000_000,
    };

    c.bench_function("action_frame_encode", |b| {
        b.iter(|| {
            let frame = Frame::action(
                black_box(actor),
                black_box(room),
                black_box(7),
                black_box(&action),
            )
            .unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_action_decode(c: &mut Criterion) {
    let actor = ActorToken::generate();
    let room = RoomId::generate();
    let action = ActionPayload::MoveItem {
        item_id: ItemId::generate(),
        position: Position::new(120.0, 48.0),
        orientation: Orientation::default(),
        timestamp_ms: 1_730_000_000_000,
    };
    let encoded = Frame::action(actor, room, 7, &action).unwrap().encode().unwrap();

    c.bench_function("action_frame_decode", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&encoded)).unwrap();
            black_box(frame.action_payload().unwrap());
        })
    });
}

fn bench_lww_resolution(c: &mut Criterion) {
    let a = ActorToken::generate();
    let b_token = ActorToken::generate();
    let writes: Vec<(Position, WriteStamp)> = (0..100)
        .map(|i| {
            let actor = if i % 2 == 0 { a } else { b_token };
            (
                Position::new(i as f32, i as f32),
                WriteStamp::new(1_000 + (i % 10), actor),
            )
        })
        .collect();

    c.bench_function("lww_apply_100_racing_writes", |b| {
        b.iter(|| {
            let mut reg = Lww::new(Position::new(0.0, 0.0), WriteStamp::new(0, a));
            for (pos, stamp) in &writes {
                black_box(reg.apply(*pos, *stamp));
            }
            black_box(*reg.get());
        })
    });
}

fn bench_feed_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("feed_publish_8_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let feed = ChangeFeed::new(256);
                let room = RoomId::generate();
                let subs: Vec<_> = {
                    let mut subs = Vec::with_capacity(8);
                    for _ in 0..8 {
                        subs.push(feed.subscribe(room, ActorToken::generate()).await);
                    }
                    subs
                };

                for _ in 0..100 {
                    feed.publish_change(
                        room,
                        Notice::ItemRemoved {
                            item_id: ItemId::generate(),
                        },
                        Audience::Everyone,
                    )
                    .await;
                }
                black_box(subs.len())
            })
        })
    });
}

fn bench_snapshot_sized_frame(c: &mut Criterion) {
    // A surface of 50 placed items, roughly a busy room.
    let actor = ActorToken::generate();
    let room = RoomId::generate();
    let items: Vec<Notice> = (0..50)
        .map(|i| Notice::ItemAdded {
            item: parlor::PlacedItem::new(
                ItemSpec::new(format!("piece-{i}")),
                actor,
                Position::new(i as f32, i as f32),
                Orientation::default(),
                WriteStamp::new(i, actor),
            ),
        })
        .collect();

    c.bench_function("change_frame_encode_50_items", |b| {
        b.iter(|| {
            for notice in &items {
                let frame = Frame::change(actor, room, black_box(notice)).unwrap();
                black_box(frame.encode().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_action_encode,
    bench_action_decode,
    bench_lww_resolution,
    bench_feed_fan_out,
    bench_snapshot_sized_frame
);
criterion_main!(benches);
