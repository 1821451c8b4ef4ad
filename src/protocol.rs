// Copyright 2021 Stratus Data Systems, Inc.

//! This module contains the types and functions used to encode and decode
//! session messages. Normal consumers drive the `server` and `client`
//! modules; the contents here are exposed for the special case of someone
//! needing to implement custom peer code.

use std::io::{Error, ErrorKind};
use std::sync::atomic::AtomicUsize;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{io, str, usize};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::*;
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// Program identifier carried in every message. A peer speaking a different
/// program is not a downstream subscriber.
pub const PROG: u32 = 0x5550_4645;

/// Protocol version. Must match the peer and the parent daemon.
pub const VERS: u32 = 1;

const MSG_OFF_TYPE: usize = 0x1;
const MSG_OFF_STATUS: usize = 0x2;
const MSG_OFF_MSGID: usize = 0x3;
const MSG_OFF_CRC: usize = 0x7;
const MSG_OFF_DATALEN: usize = 0xb;
const MSG_OFF_DATA: usize = 0xf;

/// The size of a message header.
pub const MSG_HEADER_SZ: usize = MSG_OFF_DATA;

const MSG_VERSION_1: u8 = 0x1;
const MSG_VERSION_CURRENT: u8 = MSG_VERSION_1;

/// Procedure names, as they appear on the wire.
pub mod proc {
    /// Synchronous subscription handshake (peer to engine).
    pub const SUBSCRIBE: &str = "subscribe";
    /// Missed-product lookup (peer to engine, one-way).
    pub const REQUEST_PRODUCT: &str = "request_product";
    /// Backlog replay request (peer to engine, one-way).
    pub const REQUEST_BACKLOG: &str = "request_backlog";
    /// Keep-alive probe (peer to engine, one-way).
    pub const TEST_CONNECTION: &str = "test_connection";
    /// Delivery of a looked-up product (engine to peer, one-way).
    pub const DELIVER_MISSED_PRODUCT: &str = "deliver_missed_product";
    /// Delivery of one backlog product (engine to peer, one-way).
    pub const DELIVER_BACKLOG_PRODUCT: &str = "deliver_backlog_product";
    /// Notice that a looked-up product no longer exists (engine to peer).
    pub const NO_SUCH_PRODUCT: &str = "no_such_product";
}

/// A data type representing a message id that can safely be shared between
/// threads. The `next` associated function retrieves the next id value and
/// manages the circular message id space internally.
#[derive(Default)]
pub struct MessageId(AtomicUsize);

impl MessageId {
    /// Creates a new MessageId
    pub fn new() -> Self {
        MessageId(AtomicUsize::new(0x0))
    }
}

impl Iterator for MessageId {
    type Item = usize;

    /// Returns the next message id and increments the value modulo the
    /// usize MAX_VALUE - 1.
    fn next(&mut self) -> Option<Self::Item> {
        // Increment our count. This is why we started at zero.
        let id_value = self.0.get_mut();
        let current = *id_value;
        *id_value = (*id_value + 1) % (usize::max_value() - 1);

        Some(current)
    }
}

/// An error type representing a failure to parse a buffer as a message.
#[derive(Debug)]
pub enum ParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::IOError(error)
    }
}

impl From<ParseError> for Error {
    fn from(pfr: ParseError) -> Self {
        match pfr {
            ParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse message: not enough bytes";
                Error::new(ErrorKind::Other, msg)
            }
            ParseError::IOError(e) => e,
        }
    }
}

/// An error type representing error messages that may be returned to a peer
/// in place of a synchronous reply.
#[derive(Debug, Deserialize, Serialize)]
pub struct ServerError {
    pub name: String,
    pub message: String,
}

impl ServerError {
    pub fn new(name: &str, message: &str) -> Self {
        ServerError {
            name: String::from(name),
            message: String::from(message),
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::new(ErrorKind::Other, format!("{}: {}", err.name, err.message))
    }
}

/// Represents the Type field of a message. Currently there is only one
/// valid value, JSON.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum MessageType {
    Json = 1,
}

/// Represents the Status field of a message. Calls carry requests in either
/// direction; only the subscription handshake ever produces a `Reply` or an
/// `Error`. The asynchronous procedures are calls without replies.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum MessageStatus {
    Call = 1,
    Reply = 2,
    Error = 3,
}

/// This type encapsulates the header of a message.
pub struct MessageHeader {
    /// The Type field of the message
    msg_type: MessageType,
    /// The Status field of the message
    status: MessageStatus,
    /// The message identifier
    id: u32,
    /// The CRC16 check value of the message data payload
    crc: u32,
    /// The length in bytes of the message data payload
    data_len: usize,
}

/// Represents the metadata about a message data payload: a timestamp, the
/// program and version constants, and the procedure name.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MessageMetaData {
    pub uts: u64,
    pub prog: u32,
    pub vers: u32,
    pub name: String,
}

impl MessageMetaData {
    pub fn new(n: String) -> MessageMetaData {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let now_micros =
            now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());

        MessageMetaData {
            uts: now_micros,
            prog: PROG,
            vers: VERS,
            name: n,
        }
    }

    /// True if the message was produced by a peer speaking this protocol.
    pub fn matches_protocol(&self) -> bool {
        self.prog == PROG && self.vers == VERS
    }
}

/// Encapsulates the message metadata and the JSON formatted message data.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MessageData {
    pub m: MessageMetaData,
    pub d: Value,
}

impl MessageData {
    pub fn new(n: String, d: Value) -> MessageData {
        MessageData {
            m: MessageMetaData::new(n),
            d,
        }
    }
}

/// Represents a session message including the header and data payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// The Type field of the message
    pub msg_type: MessageType,
    /// The Status field of the message
    pub status: MessageStatus,
    /// The message identifier
    pub id: u32,
    /// The length in bytes of the encoded message
    pub msg_size: Option<usize>,
    /// The data payload of the message
    pub data: MessageData,
}

impl PartialEq for Message {
    fn eq(&self, other: &Message) -> bool {
        self.msg_type == other.msg_type
            && self.status == other.status
            && self.id == other.id
            && self.msg_size == other.msg_size
            && self.data == other.data
    }
}

impl Message {
    /// Parse a byte buffer into a `Message`. Returns a `ParseError` if the
    /// available bytes cannot be parsed to a `Message`.
    pub fn parse(buf: &[u8]) -> Result<Message, ParseError> {
        Message::check_buffer_size(buf)?;
        let header = Message::parse_header(buf)?;

        Message::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[MSG_OFF_DATA..MSG_OFF_DATA + header.data_len];
        Message::validate_crc(raw_data, header.crc)?;
        let data = Message::parse_data(raw_data)?;

        Ok(Message {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            msg_size: Some(MSG_OFF_DATA + header.data_len),
            data,
        })
    }

    /// Check that the provided byte buffer contains at least `MSG_HEADER_SZ`
    /// bytes. Returns a `ParseError` if this is not the case.
    pub fn check_buffer_size(buf: &[u8]) -> Result<(), ParseError> {
        if buf.len() < MSG_HEADER_SZ {
            Err(ParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    /// Parse a portion of a byte buffer into a `MessageHeader`. Returns a
    /// `ParseError` if the available bytes cannot be parsed to a
    /// `MessageHeader`.
    pub fn parse_header(buf: &[u8]) -> Result<MessageHeader, ParseError> {
        if buf[0] != MSG_VERSION_CURRENT {
            let msg = format!("Unsupported framing version: {}", buf[0]);
            return Err(ParseError::IOError(Error::new(ErrorKind::Other, msg)));
        }
        let msg_type =
            FromPrimitive::from_u8(buf[MSG_OFF_TYPE]).ok_or_else(|| {
                let msg = "Failed to parse message type";
                ParseError::IOError(Error::new(ErrorKind::Other, msg))
            })?;
        let status =
            FromPrimitive::from_u8(buf[MSG_OFF_STATUS]).ok_or_else(|| {
                let msg = "Failed to parse message status";
                ParseError::IOError(Error::new(ErrorKind::Other, msg))
            })?;
        let msg_id =
            BigEndian::read_u32(&buf[MSG_OFF_MSGID..MSG_OFF_MSGID + 4]);
        let expected_crc =
            BigEndian::read_u32(&buf[MSG_OFF_CRC..MSG_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[MSG_OFF_DATALEN..MSG_OFF_DATALEN + 4])
                as usize;

        Ok(MessageHeader {
            msg_type,
            status,
            id: msg_id,
            crc: expected_crc,
            data_len,
        })
    }

    fn validate_data_length(
        buf: &[u8],
        data_length: usize,
    ) -> Result<(), ParseError> {
        if buf.len() < (MSG_HEADER_SZ + data_length) {
            Err(ParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), ParseError> {
        let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated_crc {
            let msg = "Calculated CRC does not match the provided CRC";
            Err(ParseError::IOError(Error::new(ErrorKind::Other, msg)))
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<MessageData, ParseError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
                let msg = "Failed to parse data payload as JSON";
                ParseError::IOError(Error::new(ErrorKind::Other, msg))
            }),
            Err(_) => {
                let msg = "Failed to parse data payload as UTF-8";
                Err(ParseError::IOError(Error::new(ErrorKind::Other, msg)))
            }
        }
    }

    /// Returns a `Message` that represents a procedure call with the
    /// provided message identifier and data payload. Calls to the
    /// asynchronous procedures never receive a reply.
    pub fn call(msg_id: u32, data: MessageData) -> Message {
        Message {
            msg_type: MessageType::Json,
            status: MessageStatus::Call,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    /// Returns a `Message` that represents the synchronous reply to a call
    /// with the provided message identifier and data payload.
    pub fn reply(msg_id: u32, data: MessageData) -> Message {
        Message {
            msg_type: MessageType::Json,
            status: MessageStatus::Reply,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    /// Returns a `Message` that represents an error reply with the provided
    /// message identifier and data payload.
    pub fn error(msg_id: u32, data: MessageData) -> Message {
        Message {
            msg_type: MessageType::Json,
            status: MessageStatus::Error,
            id: msg_id,
            msg_size: None,
            data,
        }
    }
}

/// Parse as many complete messages out of `buf` as are available, consuming
/// the parsed bytes. Returns `None` when the buffer holds no complete
/// message yet; the caller should read more bytes and try again.
pub fn decode_buf(buf: &mut BytesMut) -> Result<Option<Vec<Message>>, Error> {
    let mut msgs: Vec<Message> = Vec::new();

    while !buf.is_empty() {
        match Message::parse(&buf) {
            Ok(parsed_msg) => {
                // `parse` always sets `msg_size` to the encoded length
                let msg_size = parsed_msg
                    .msg_size
                    .ok_or_else(|| Error::new(ErrorKind::Other, "no size"))?;
                buf.advance(msg_size);
                msgs.push(parsed_msg);
            }
            Err(ParseError::NotEnoughBytes(_)) => break,
            Err(err) => {
                let msg =
                    format!("failed to parse request: {}", Error::from(err));
                return Err(Error::new(ErrorKind::Other, msg));
            }
        }
    }

    if msgs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(msgs))
    }
}

/// Encode a `Message` into a byte buffer. The `Result` contains a unit type
/// on success and an error string on failure.
pub fn encode_msg(msg: &Message, buf: &mut BytesMut) -> Result<(), String> {
    let m_msg_type_u8 = msg.msg_type.to_u8();
    let m_status_u8 = msg.status.to_u8();
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let data_str = serde_json::to_string(&msg.data)
                .map_err(|e| format!("Failed to encode payload: {}", e))?;
            let data_len = data_str.len();
            let buf_capacity = buf.capacity();
            if buf.len() + MSG_HEADER_SZ + data_len > buf_capacity {
                buf.reserve(MSG_HEADER_SZ + data_len);
            }
            buf.put_u8(MSG_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u32(msg.id);
            buf.put_u32(u32::from(State::<ARC>::calculate(
                data_str.as_bytes(),
            )));
            buf.put_u32(data_len as u32);
            buf.put_slice(data_str.as_bytes());
            Ok(())
        }
        (None, Some(_)) => Err(String::from("Invalid message type")),
        (Some(_), None) => Err(String::from("Invalid status")),
        (None, None) => Err(String::from("Invalid message type and status")),
    }
}
