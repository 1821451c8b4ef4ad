// Copyright 2021 Stratus Data Systems, Inc.

//! A miniature parent daemon: registers one potential publisher, seeds a
//! demo product store when none exists, and serves one engine session per
//! accepted connection. Real deployments fork an engine process per peer;
//! here a thread stands in for the fork.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use upfeed::pim::ProdIndexMapWriter;
use upfeed::policy::StaticPolicy;
use upfeed::pq::ProductQueue;
use upfeed::server;
use upfeed::session::{Session, SessionConfig};
use upfeed::types::{
    CidrAddr, Feed, McastInfo, Product, ProductInfo, Signature, VcEndPoint,
};
use upfeed::umm::McastManager;

static APP: &'static str = "upfeed-serve";
static DEFAULT_ADDR: &'static str = "127.0.0.1:2030";
static DEFAULT_QUEUE: &'static str = "demo.pq";
const DEFAULT_FEED: u32 = 0xff;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Demo upstream daemon serving engine sessions")
        .version(crate_version!())
        .arg(
            Arg::with_name("addr")
                .help("Listen address (Default: 127.0.0.1:2030)")
                .long("addr")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("queue")
                .help("Pathname of the product queue (Default: demo.pq)")
                .long("queue")
                .short("q")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("feed")
                .help("Feed mask multicast by the demo publisher, in hex")
                .long("feed")
                .short("f")
                .takes_value(true),
        )
        .get_matches()
}

/// Creates a queue with a handful of products and an index map resolving
/// their multicast indexes, so recovery requests have something to find.
fn seed_store(queue_path: &Path, feed: Feed) -> Result<(), String> {
    let mut pq =
        ProductQueue::create(queue_path).map_err(|e| e.to_string())?;
    let dir = queue_path.parent().unwrap_or_else(|| Path::new("."));
    let mut pim = ProdIndexMapWriter::open_for_writing(dir, feed)
        .map_err(|e| e.to_string())?;

    for i in 1u8..=3 {
        let data = format!("demo product {} payload", i).into_bytes();
        let product = Product {
            info: ProductInfo {
                arrival: Utc::now(),
                signature: Signature([i; 16]),
                origin: String::from("demo.origin"),
                feed,
                seq_num: u32::from(i),
                ident: format!("demo-product-{}", i),
                size: data.len() as u32,
            },
            data,
        };
        pq.insert(&product).map_err(|e| e.to_string())?;
        pim.put(u64::from(i), &product.info.signature)
            .map_err(|e| e.to_string())?;
    }

    Ok(())
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let addr = matches.value_of("addr").unwrap_or(DEFAULT_ADDR);
    let queue_path = PathBuf::from(
        matches.value_of("queue").unwrap_or(DEFAULT_QUEUE),
    );
    let feed_mask = value_t!(matches, "feed", String)
        .map(|s| u32::from_str_radix(&s, 16).unwrap_or(DEFAULT_FEED))
        .unwrap_or(DEFAULT_FEED);
    let feed = Feed(feed_mask);

    if !queue_path.exists() {
        info!(root_log, "seeding demo product store";
            "queue" => %queue_path.display());
        if let Err(e) = seed_store(&queue_path, feed) {
            error!(root_log, "couldn't seed product store: {}", e);
            process::exit(1);
        }
    }

    let manager = Arc::new(McastManager::new());
    manager
        .add_potential_sender(
            McastInfo {
                feed,
                group: "224.0.1.2:38800".parse().unwrap(),
                fmtp_server: "127.0.0.1:5555".parse().unwrap(),
            },
            CidrAddr::new("10.0.0.128".parse().unwrap(), 25),
        )
        .unwrap_or_else(|e| {
            error!(root_log, "couldn't register publisher: {}", e);
            process::exit(1);
        });
    let policy = Arc::new(StaticPolicy::new().allow_any(feed));

    let config = SessionConfig {
        workgroup: String::from("demo-workgroup"),
        local_vc_end: VcEndPoint::new("dummy-local-switch", "port0", 4000),
        queue_path,
    };

    let listener = TcpListener::bind(addr).unwrap_or_else(|e| {
        error!(root_log, "failed to bind {}: {}", addr, e);
        process::exit(1);
    });
    info!(root_log, "listening for subscription requests";
        "address" => addr);

    for stream in listener.incoming() {
        match stream {
            Ok(socket) => {
                let session_log = root_log.clone();
                let mut session = Session::new(
                    config.clone(),
                    Arc::clone(&manager),
                    policy.clone(),
                    Some(&session_log),
                );
                thread::spawn(move || {
                    if let Err(e) = server::serve_connection(
                        socket,
                        &mut session,
                        Some(&session_log),
                    ) {
                        error!(session_log,
                            "failed to process connection"; "err" => %e);
                    }
                });
            }
            Err(e) => {
                error!(root_log, "failed to accept socket"; "err" => %e);
            }
        }
    }
}
