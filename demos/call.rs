// Copyright 2021 Stratus Data Systems, Inc.

//! Command-line downstream peer: subscribes to an engine and optionally
//! exercises the recovery procedures, printing whatever the engine sends
//! back on the shared connection.

use std::io::Error;
use std::net::{SocketAddr, TcpStream};
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::{json, Value};

use upfeed::client::{self, Recv};
use upfeed::protocol::{proc, Message, MessageId, MessageStatus};
use upfeed::types::{
    BacklogSpec, Feed, Signature, SubscriptionReply, SubscriptionRequest,
    VcEndPoint,
};

static APP: &'static str = "upfeed-call";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;
const DEFAULT_FEED: u32 = 0xff;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line downstream peer for an upfeed engine")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote engine")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote engine (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("feed")
                .help("Requested feed mask, in hex (Default: ff)")
                .long("feed")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("request_product")
                .help("Request the product with this multicast index")
                .long("request-product")
                .short("r")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("backlog_after")
                .help("Request the backlog after this signature (32 hex digits)")
                .long("backlog-after")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("backlog_before")
                .help("Stop the backlog at this signature (32 hex digits)")
                .long("backlog-before")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("time_offset")
                .help("Backlog start as seconds before now (Default: 3600)")
                .long("time-offset")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("expect")
                .help("How many deliveries to wait for (Default: 1)")
                .long("expect")
                .short("n")
                .takes_value(true),
        )
        .get_matches()
}

fn subscribe(
    stream: &mut TcpStream,
    msg_id: &mut MessageId,
    feed: Feed,
) -> Result<SubscriptionReply, Error> {
    let request = SubscriptionRequest {
        feed,
        vc_end: VcEndPoint::new("dummy-peer-switch", "port1", 100),
    };
    let args = json!([request]);
    client::send(String::from(proc::SUBSCRIBE), args, msg_id, stream)?;

    let mut reply = None;
    client::receive(stream, |msg: &Message| {
        if msg.status == MessageStatus::Reply {
            let mut replies: Vec<SubscriptionReply> =
                serde_json::from_value(msg.data.d.clone())
                    .map_err(|e| Error::new(std::io::ErrorKind::Other, e))?;
            if replies.len() == 1 {
                reply = Some(replies.remove(0));
            }
            Ok(Recv::Done)
        } else {
            Ok(Recv::Continue)
        }
    })?;

    reply.ok_or_else(|| {
        Error::new(std::io::ErrorKind::Other, "no subscription reply")
    })
}

fn print_deliveries(
    stream: &mut TcpStream,
    expect: usize,
) -> Result<(), Error> {
    let mut seen = 0;
    client::receive(stream, |msg: &Message| {
        println!("{}: {}", msg.data.m.name, msg.data.d);
        seen += 1;
        if seen >= expect {
            Ok(Recv::Done)
        } else {
            Ok(Recv::Continue)
        }
    })
    .map(|_| ())
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let feed = matches
        .value_of("feed")
        .map(|s| {
            u32::from_str_radix(s, 16).unwrap_or_else(|e| {
                eprintln!("Failed to parse feed mask: {}", e);
                process::exit(1)
            })
        })
        .map(Feed)
        .unwrap_or(Feed(DEFAULT_FEED));
    let expect = value_t!(matches, "expect", usize).unwrap_or(1);

    let mut stream = TcpStream::connect(&addr).unwrap_or_else(|e| {
        eprintln!("Failed to connect to engine: {}", e);
        process::exit(1)
    });

    let mut msg_id = MessageId::new();

    let reply = subscribe(&mut stream, &mut msg_id, feed)
        .unwrap_or_else(|e| {
            eprintln!("Subscription failed: {}", e);
            process::exit(1)
        });
    println!("subscription reply: {:?}", reply);

    if let SubscriptionReply::Unauth = reply {
        return;
    }

    let result = if matches.is_present("request_product") {
        let index = value_t!(matches, "request_product", u64)
            .unwrap_or_else(|e| e.exit());
        client::send(
            String::from(proc::REQUEST_PRODUCT),
            json!([index]),
            &mut msg_id,
            &mut stream,
        )
        .and_then(|_| print_deliveries(&mut stream, expect))
    } else if matches.is_present("backlog_before") {
        let before = matches
            .value_of("backlog_before")
            .and_then(|s| s.parse::<Signature>().ok())
            .unwrap_or_else(|| {
                eprintln!("Failed to parse backlog-before signature");
                process::exit(1)
            });
        let after = matches
            .value_of("backlog_after")
            .map(|s| {
                s.parse::<Signature>().unwrap_or_else(|e| {
                    eprintln!("Failed to parse backlog-after: {}", e);
                    process::exit(1)
                })
            });
        let time_offset = value_t!(matches, "time_offset", u64).unwrap_or(3600);
        let spec = BacklogSpec {
            after,
            time_offset,
            before,
        };
        let args = serde_json::to_value(&spec)
            .map(|v| Value::Array(vec![v]))
            .unwrap_or_else(|e| {
                eprintln!("Failed to encode backlog spec: {}", e);
                process::exit(1)
            });
        client::send(
            String::from(proc::REQUEST_BACKLOG),
            args,
            &mut msg_id,
            &mut stream,
        )
        .and_then(|_| print_deliveries(&mut stream, expect))
    } else {
        client::send(
            String::from(proc::TEST_CONNECTION),
            json!([]),
            &mut msg_id,
            &mut stream,
        )
        .map(|_| ())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }
}
