use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use quire_collab::broadcast::BroadcastGroup;
use quire_collab::protocol::{
    ClientDiffMessage, ClientMessage, DocData, DocInfo, Participant, ServerDocDataMessage,
    ServerMessage,
};
use quire_collab::room::{DocumentRoom, Recipient};
use quire_collab::session::{CollabSession, SessionConfig};
use quire_core::{Document, Schema, Step, Transform};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

fn typing_steps(schema: &Arc<Schema>, doc: &Document, chars: usize) -> (Vec<Step>, Document) {
    let mut tr = Transform::new(schema.clone(), doc.clone());
    for i in 0..chars {
        let _ = tr.insert_text(1 + i, "x");
    }
    (tr.steps().to_vec(), tr.doc().clone())
}

fn diff(v: u64, ds: Vec<Step>, cid: u64) -> ClientDiffMessage {
    ClientDiffMessage {
        v,
        ds,
        rid: v,
        cid: Some(cid),
        server_fix: false,
    }
}

fn doc_data(doc: &Document, v: u64, m: Option<Vec<ClientDiffMessage>>) -> ServerMessage {
    ServerMessage::DocData(ServerDocDataMessage {
        doc: DocData {
            v,
            content: doc.to_json(),
        },
        time: Utc::now(),
        doc_info: DocInfo {
            id: Uuid::nil(),
            title: doc.first_block_text(),
            updated: Utc::now(),
        },
        m,
    })
}

fn bench_diff_encode(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"]);
    let (steps, _) = typing_steps(&schema, &base, 10);
    let msg = ClientMessage::Diff(diff(1, steps, 7));

    c.bench_function("diff_encode_10_steps", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_diff_decode(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"]);
    let (steps, _) = typing_steps(&schema, &base, 10);
    let encoded = ClientMessage::Diff(diff(1, steps, 7)).encode().unwrap();

    c.bench_function("diff_decode_10_steps", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_room_accept_diffs(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"; 20]);
    let mut doc = base.clone();
    let mut diffs = Vec::new();
    for v in 0..1000u64 {
        let (steps, next) = typing_steps(&schema, &doc, 1);
        diffs.push(diff(v, steps, 7));
        doc = next;
    }

    c.bench_function("room_accept_1000_diffs", |b| {
        b.iter(|| {
            let mut room =
                DocumentRoom::with_document(Uuid::nil(), schema.clone(), base.clone(), 0, 100, 10);
            for d in &diffs {
                black_box(room.handle_message(ClientMessage::Diff(d.clone())));
            }
            assert_eq!(room.version(), 1000);
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let msg = ServerMessage::ConfirmVersion { v: 42 };

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let rx = group.add_peer(Participant::new(format!("Peer{i}"))).await;
                    receivers.push(rx);
                }

                let from = Uuid::new_v4();
                for _ in 0..1000 {
                    group
                        .broadcast(from, Recipient::Others, black_box(&msg))
                        .unwrap();
                }
            });
        })
    });
}

fn bench_session_replay_log(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"; 20]);
    let mut doc = base.clone();
    let mut log = Vec::new();
    for v in 0..100u64 {
        let (steps, next) = typing_steps(&schema, &doc, 1);
        log.push(diff(v, steps, 99));
        doc = next;
    }
    let catch_up = doc_data(&doc, 100, Some(log));

    c.bench_function("session_replay_100_diffs", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut session = CollabSession::new(
                Uuid::nil(),
                Uuid::nil(),
                "bench",
                schema.clone(),
                SessionConfig::default(),
            );
            session.set_connected(true);
            session.subscribe_message(now);
            session.handle_message(doc_data(&base, 0, None), now).unwrap();
            black_box(session.handle_message(catch_up.clone(), now).unwrap());
            assert_eq!(session.version(), 100);
        })
    });
}

criterion_group!(
    benches,
    bench_diff_encode,
    bench_diff_decode,
    bench_room_accept_diffs,
    bench_broadcast_1000_messages,
    bench_session_replay_log,
);
criterion_main!(benches);
