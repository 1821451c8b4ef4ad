// Copyright 2021 Stratus Data Systems, Inc.

//! End-to-end exercise of an engine session over a real TCP connection:
//! handshake, missed-product lookup, backlog replay, connection probe, and
//! orderly shutdown, with the downstream role played by the caller
//! utilities in `upfeed::client`.

use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Duration, Utc};
use serde_json::json;
use slog::{o, Drain, Level, LevelFilter, Logger};
use tempfile::{tempdir, TempDir};

use upfeed::client::{self, Recv};
use upfeed::pim::ProdIndexMapWriter;
use upfeed::policy::StaticPolicy;
use upfeed::pq::ProductQueue;
use upfeed::protocol::{proc, Message, MessageId, MessageStatus};
use upfeed::server;
use upfeed::session::{Session, SessionConfig, SessionState};
use upfeed::types::{
    BacklogSpec, CidrAddr, Feed, McastInfo, MissedProduct, Product,
    ProductInfo, Signature, SubscriptionReply, SubscriptionRequest,
    VcEndPoint,
};
use upfeed::umm::McastManager;

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn product(sig_byte: u8, feed: Feed, secs_ago: i64) -> Product {
    let data = format!("payload of product {:02x}", sig_byte).into_bytes();
    Product {
        info: ProductInfo {
            arrival: Utc::now() - Duration::seconds(secs_ago),
            signature: Signature([sig_byte; 16]),
            origin: String::from("test.origin"),
            feed,
            seq_num: u32::from(sig_byte),
            ident: format!("product-{:02x}", sig_byte),
            size: data.len() as u32,
        },
        data,
    }
}

/// Seeds a product store and index map under `dir` and returns the engine
/// configuration pointing at it.
fn seed_store(
    dir: &Path,
    feed: Feed,
    products: &[Product],
    index_map: &[(u64, Signature)],
) -> SessionConfig {
    let queue_path = dir.join("products.pq");
    let mut pq = ProductQueue::create(&queue_path).unwrap();
    for p in products {
        pq.insert(p).unwrap();
    }
    drop(pq);

    let mut pim = ProdIndexMapWriter::open_for_writing(dir, feed).unwrap();
    for (index, sig) in index_map {
        pim.put(*index, sig).unwrap();
    }
    drop(pim);

    SessionConfig {
        workgroup: String::from("test-workgroup"),
        local_vc_end: VcEndPoint::new("dummy-local-switch", "port0", 4000),
        queue_path,
    }
}

fn engine_fixture(
    policy: StaticPolicy,
    config: SessionConfig,
    sender_feed: Feed,
) -> (Arc<McastManager>, Session) {
    let manager = Arc::new(McastManager::new());
    manager
        .add_potential_sender(
            McastInfo {
                feed: sender_feed,
                group: "224.0.1.2:38800".parse().unwrap(),
                fmtp_server: "10.0.0.1:5555".parse().unwrap(),
            },
            CidrAddr::new(Ipv4Addr::new(10, 0, 0, 128), 25),
        )
        .unwrap();

    let session = Session::new(
        config,
        Arc::clone(&manager),
        Arc::new(policy),
        Some(&test_log()),
    );

    (manager, session)
}

/// Spawns the dispatcher for a single accepted connection and returns the
/// connected downstream stream plus the join handle yielding the session's
/// final state.
fn spawn_engine(
    mut session: Session,
) -> (TcpStream, thread::JoinHandle<(bool, SessionState)>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().expect("failed to accept");
        let served = server::serve_connection(
            socket,
            &mut session,
            Some(&test_log()),
        )
        .is_ok();
        (served, session.state())
    });

    let stream = TcpStream::connect(addr).expect("failed to connect");
    (stream, handle)
}

fn subscribe(
    stream: &mut TcpStream,
    msg_id: &mut MessageId,
    feed: Feed,
) -> Result<SubscriptionReply, std::io::Error> {
    let request = SubscriptionRequest {
        feed,
        vc_end: VcEndPoint::new("dummy-peer-switch", "port1", 100),
    };
    client::send(
        String::from(proc::SUBSCRIBE),
        json!([request]),
        msg_id,
        stream,
    )?;

    let mut reply = None;
    client::receive(stream, |msg: &Message| {
        assert_eq!(msg.status, MessageStatus::Reply);
        let mut replies: Vec<SubscriptionReply> =
            serde_json::from_value(msg.data.d.clone()).unwrap();
        assert_eq!(replies.len(), 1);
        reply = Some(replies.remove(0));
        Ok(Recv::Done)
    })?;

    Ok(reply.expect("no subscription reply"))
}

fn receive_calls(stream: &mut TcpStream, expected: usize) -> Vec<Message> {
    let mut calls = Vec::new();
    client::receive(stream, |msg: &Message| {
        assert_eq!(msg.status, MessageStatus::Call);
        calls.push(msg.clone());
        if calls.len() == expected {
            Ok(Recv::Done)
        } else {
            Ok(Recv::Continue)
        }
    })
    .unwrap();
    calls
}

fn seeded_session(dir: &TempDir) -> Session {
    let feed = Feed(0x0f);
    let products = [
        product(1, Feed(0x01), 30),
        product(2, Feed(0x01), 20),
        product(3, Feed(0x01), 10),
    ];
    let config = seed_store(
        dir.path(),
        feed,
        &products,
        &[(42, Signature([2; 16]))],
    );
    let (_manager, session) =
        engine_fixture(StaticPolicy::new().allow_any(feed), config, feed);
    session
}

#[test]
fn session_serves_recovery_traffic_end_to_end() {
    let dir = tempdir().unwrap();
    let session = seeded_session(&dir);
    let (mut stream, handle) = spawn_engine(session);
    let mut msg_id = MessageId::new();

    // Handshake
    let reply = subscribe(&mut stream, &mut msg_id, Feed(0x0f)).unwrap();
    match reply {
        SubscriptionReply::Ok { info, fmtp_addr } => {
            assert_eq!(info.feed, Feed(0x0f));
            assert_eq!(info.group, "224.0.1.2:38800".parse().unwrap());
            assert_eq!(
                fmtp_addr,
                CidrAddr::new(Ipv4Addr::new(10, 0, 0, 129), 25)
            );
        }
        other => panic!("expected Ok reply, got {:?}", other),
    }

    // Missed-product lookup for a mapped index
    client::send(
        String::from(proc::REQUEST_PRODUCT),
        json!([42]),
        &mut msg_id,
        &mut stream,
    )
    .unwrap();
    let calls = receive_calls(&mut stream, 1);
    assert_eq!(calls[0].data.m.name, proc::DELIVER_MISSED_PRODUCT);
    let missed: Vec<MissedProduct> =
        serde_json::from_value(calls[0].data.d.clone()).unwrap();
    assert_eq!(missed[0].index, 42);
    assert_eq!(missed[0].product.info.signature, Signature([2; 16]));

    // Missed-product lookup for an unmapped index
    client::send(
        String::from(proc::REQUEST_PRODUCT),
        json!([99]),
        &mut msg_id,
        &mut stream,
    )
    .unwrap();
    let calls = receive_calls(&mut stream, 1);
    assert_eq!(calls[0].data.m.name, proc::NO_SUCH_PRODUCT);

    // Backlog between two signatures
    let spec = BacklogSpec {
        after: Some(Signature([1; 16])),
        time_offset: 0,
        before: Signature([3; 16]),
    };
    client::send(
        String::from(proc::REQUEST_BACKLOG),
        json!([spec]),
        &mut msg_id,
        &mut stream,
    )
    .unwrap();
    let calls = receive_calls(&mut stream, 1);
    assert_eq!(calls[0].data.m.name, proc::DELIVER_BACKLOG_PRODUCT);
    let prods: Vec<Product> =
        serde_json::from_value(calls[0].data.d.clone()).unwrap();
    assert_eq!(prods[0].info.signature, Signature([2; 16]));

    // Probe is one-way: nothing comes back
    client::send(
        String::from(proc::TEST_CONNECTION),
        json!([]),
        &mut msg_id,
        &mut stream,
    )
    .unwrap();

    // Orderly shutdown: engine sees EOF and drains out still serving
    stream.shutdown(Shutdown::Write).unwrap();
    let (served, state) = handle.join().unwrap();
    assert!(served);
    assert_eq!(state, SessionState::Serving);
}

#[test]
fn unauthorized_peer_gets_a_typed_rejection() {
    let dir = tempdir().unwrap();
    let feed = Feed(0x0f);
    let config = seed_store(dir.path(), feed, &[], &[]);
    let (_manager, session) =
        engine_fixture(StaticPolicy::new(), config, feed);

    let (mut stream, handle) = spawn_engine(session);
    let mut msg_id = MessageId::new();

    let reply = subscribe(&mut stream, &mut msg_id, feed).unwrap();
    assert_eq!(reply, SubscriptionReply::Unauth);

    stream.shutdown(Shutdown::Write).unwrap();
    let (served, state) = handle.join().unwrap();
    assert!(served);
    assert_eq!(state, SessionState::Init);
}

#[test]
fn system_failure_during_handshake_kills_the_session() {
    let dir = tempdir().unwrap();
    let feed = Feed(0x0f);
    // Queue exists but the index map for the feed does not: the handshake
    // fails after the manager subscription and no reply can be built
    let queue_path = dir.path().join("products.pq");
    ProductQueue::create(&queue_path).unwrap();
    let config = SessionConfig {
        workgroup: String::from("test-workgroup"),
        local_vc_end: VcEndPoint::new("dummy-local-switch", "port0", 4000),
        queue_path,
    };
    let (manager, session) =
        engine_fixture(StaticPolicy::new().allow_any(feed), config, feed);

    let (mut stream, handle) = spawn_engine(session);
    let mut msg_id = MessageId::new();

    let result = subscribe(&mut stream, &mut msg_id, feed);
    assert!(result.is_err());

    let (served, state) = handle.join().unwrap();
    assert!(served);
    assert_eq!(state, SessionState::Done);

    // The failed handshake returned the allocated address to the pool
    let (_, addr) = manager.subscribe(feed).unwrap();
    assert_eq!(addr.addr, Ipv4Addr::new(10, 0, 0, 129));
}
