// Copyright 2021 Stratus Data Systems, Inc.

//! Upfeed: the upstream session engine of a meteorological
//! data-distribution service.
//!
//! An engine instance is forked per downstream peer by a parent daemon and
//! serves exactly one subscriber of one data feed. It
//!
//! * authenticates and authorizes the subscription against a policy oracle,
//! * ensures a multicast publisher exists for the requested feed through
//!   the multicast manager, which also allocates the peer's FMTP client
//!   address,
//! * serves two asynchronous streams of recovery traffic (missed-product
//!   lookups and backlog replay) out of the local product store, and
//! * tears down every resource it acquired on any termination path.
//!
//! The engine does not multicast products itself (a sibling process does),
//! does not decide authorization policy, and does not persist session state
//! across restarts. A failed session terminates the process; the parent
//! daemon accepts the next connection.
//!
//! Protocol overview
//!
//! Communication with the peer is discrete framed messages over a single
//! TCP connection. A message has the following structure:
//!
//! * VERSION   1-byte integer. The only supported value is "1".
//!
//! * TYPE      1-byte integer. The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer. The only supported values are:
//!
//!     * STATUS_CALL  0x1  indicates a procedure call
//!
//!     * STATUS_REPLY 0x2  indicates a synchronous reply
//!
//!     * STATUS_ERROR 0x3  indicates an error reply
//!
//! * MSGID0...MSGID3    4-byte big-endian unsigned integer, a unique
//!                    identifier for this message.
//!
//! * CRC0...CRC3        4-byte big-endian unsigned integer representing the
//!                     CRC16 value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the
//!                    number of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload. This is a JSON-encoded object with
//!                    properties `m` (procedure metadata: program, version,
//!                    procedure name, timestamp) and `d` (arguments).
//!
//! ### Procedures
//!
//! | # | Name | Direction | Sync? |
//! | - | ---- | --------- | ----- |
//! | 1 | `subscribe` | peer to engine | synchronous |
//! | 2 | `request_product` | peer to engine | one-way |
//! | 3 | `request_backlog` | peer to engine | one-way |
//! | 4 | `test_connection` | peer to engine | one-way |
//! | 5 | `deliver_missed_product` | engine to peer | one-way |
//! | 6 | `deliver_backlog_product` | engine to peer | one-way |
//! | 7 | `no_such_product` | engine to peer | one-way |
//!
//! After `subscribe` completes, the accepted socket is reused in both
//! directions. This only works because every subsequent exchange is
//! asynchronous: nothing ever waits for a reply, so the server halves on
//! each side never interfere with the (non-existent) reply traffic. The
//! engine's dispatcher therefore must never send a reply for procedures
//! 2–4, and its client half sends procedures 5–7 as fire-and-forget calls
//! whose success is a successful socket write.

#![allow(missing_docs)]

pub mod client;
pub mod error;
pub mod pim;
pub mod policy;
pub mod pq;
pub mod protocol;
pub mod server;
pub mod session;
pub mod types;
pub mod umm;
pub mod vcircuit;
