// Copyright 2021 Stratus Data Systems, Inc.

//! The client half of the transport. Two roles live here:
//!
//! * `PeerClient` is the engine's outbound side. After a successful
//!   handshake the engine sends one-way product deliveries to the peer over
//!   the same TCP connection its server half accepted; the file descriptor
//!   is shared with the dispatcher.
//! * `send` and `receive` are caller utilities for the downstream role,
//!   used by the demo subscriber and the test suite to drive an engine.

use std::io::{Error, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};

use bytes::BytesMut;
use serde_json::Value;
use slog::{debug, o, Drain, Logger};

use crate::error::EngineError;
use crate::protocol;
use crate::protocol::{
    proc, Message, MessageData, MessageId, MessageStatus, ParseError,
    ServerError,
};
use crate::types::{MissedProduct, Product};

/// The engine's one-way transport to its downstream peer, created on the
/// connection the dispatcher accepted. A one-way call is complete once the
/// bytes are written; there is no reply to wait for, and any write failure
/// is fatal to the session that owns this handle.
pub struct PeerClient {
    stream: TcpStream,
    peer: SocketAddr,
    msg_id: MessageId,
    log: Logger,
}

impl PeerClient {
    /// Creates the outbound transport on an already-accepted connection.
    /// The socket is shared with the server side via a duplicated handle.
    pub fn from_connection(
        stream: &TcpStream,
        log: Option<&Logger>,
    ) -> Result<PeerClient, EngineError> {
        let peer = stream.peer_addr()?;
        let stream = stream.try_clone()?;

        // If no logger was provided use the slog StdLog drain by default
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Ok(PeerClient {
            stream,
            peer,
            msg_id: MessageId::new(),
            log,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send_oneway(
        &mut self,
        method: &str,
        args: Value,
    ) -> Result<(), EngineError> {
        // It is safe to call unwrap on the msg_id iterator because the
        // implementation of Iterator for MessageId will only ever return
        // Some(id). The Option return type is required by the Iterator
        // trait.
        let msg = Message::call(
            self.msg_id.next().unwrap() as u32,
            MessageData::new(String::from(method), args),
        );
        let mut write_buf = BytesMut::new();
        protocol::encode_msg(&msg, &mut write_buf)
            .map_err(EngineError::System)?;
        self.stream.write_all(&write_buf).map_err(|e| {
            EngineError::System(format!(
                "couldn't send {} to downstream peer {}: {}",
                method, self.peer, e
            ))
        })?;
        Ok(())
    }

    /// Sends a product the peer's multicast layer missed, tagged with the
    /// sequence index the peer asked about.
    pub fn deliver_missed_product(
        &mut self,
        missed: &MissedProduct,
    ) -> Result<(), EngineError> {
        debug!(self.log, "delivering missed product";
            "index" => missed.index,
            "ident" => %missed.product.info.ident);
        let args = serde_json::to_value(missed)
            .map_err(|e| EngineError::System(e.to_string()))?;
        self.send_oneway(proc::DELIVER_MISSED_PRODUCT, Value::Array(vec![args]))
    }

    /// Sends one product of a backlog replay.
    pub fn deliver_backlog_product(
        &mut self,
        product: &Product,
    ) -> Result<(), EngineError> {
        debug!(self.log, "delivering backlog product";
            "ident" => %product.info.ident);
        let args = serde_json::to_value(product)
            .map_err(|e| EngineError::System(e.to_string()))?;
        self.send_oneway(
            proc::DELIVER_BACKLOG_PRODUCT,
            Value::Array(vec![args]),
        )
    }

    /// Tells the peer a looked-up sequence index no longer resolves to a
    /// product on this side.
    pub fn no_such_product(&mut self, index: u64) -> Result<(), EngineError> {
        debug!(self.log, "no such product"; "index" => index);
        self.send_oneway(proc::NO_SUCH_PRODUCT, Value::Array(vec![index.into()]))
    }
}

/// What a `receive` handler wants done after seeing a message.
pub enum Recv {
    /// Keep reading messages.
    Continue,
    /// Stop reading; `receive` returns successfully.
    Done,
}

enum BufferAction {
    Keep,
    Trim(usize),
    Done,
}

/// Send a call to an engine using the provided TCP stream. Used by the
/// downstream role for the handshake and the one-way recovery requests.
pub fn send(
    method: String,
    args: Value,
    msg_id: &mut MessageId,
    stream: &mut TcpStream,
) -> Result<usize, Error> {
    // It is safe to call unwrap on the msg_id iterator because the
    // implementation of Iterator for MessageId will only ever return
    // Some(id). The Option return type is required by the Iterator trait.
    let msg = Message::call(
        msg_id.next().unwrap() as u32,
        MessageData::new(method, args),
    );
    let mut write_buf = BytesMut::new();
    match protocol::encode_msg(&msg, &mut write_buf) {
        Ok(_) => stream.write(write_buf.as_ref()),
        Err(err_str) => Err(Error::new(ErrorKind::Other, err_str)),
    }
}

/// Receive messages from an engine on the provided TCP stream and call
/// `handler` on each until the handler is done. An `Error`-status message
/// terminates the stream with the decoded server error.
pub fn receive<F>(
    stream: &mut TcpStream,
    mut handler: F,
) -> Result<usize, Error>
where
    F: FnMut(&Message) -> Result<Recv, Error>,
{
    let mut stream_end = false;
    let mut msg_buf: Vec<u8> = Vec::new();
    let mut total_bytes = 0;
    let mut result = Ok(total_bytes);

    while !stream_end {
        let mut read_buf = [0; 128];
        match stream.read(&mut read_buf) {
            Ok(0) => {
                result = Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Received EOF (0 bytes) from server",
                ));
                stream_end = true;
            }
            Ok(byte_count) => {
                total_bytes += byte_count;
                msg_buf.extend_from_slice(&read_buf[0..byte_count]);
                match parse_and_handle_messages(
                    msg_buf.as_slice(),
                    &mut handler,
                ) {
                    Ok(BufferAction::Keep) => (),
                    Ok(BufferAction::Trim(rest_offset)) => {
                        let truncate_bytes = msg_buf.len() - rest_offset;
                        msg_buf.rotate_left(rest_offset);
                        msg_buf.truncate(truncate_bytes);
                        result = Ok(total_bytes);
                    }
                    Ok(BufferAction::Done) => {
                        result = Ok(total_bytes);
                        stream_end = true;
                    }
                    Err(e) => {
                        result = Err(e);
                        stream_end = true
                    }
                }
            }
            Err(err) => {
                result = Err(err);
                stream_end = true
            }
        }
    }
    result
}

fn parse_and_handle_messages<F>(
    read_buf: &[u8],
    handler: &mut F,
) -> Result<BufferAction, Error>
where
    F: FnMut(&Message) -> Result<Recv, Error>,
{
    let mut offset = 0;
    let mut done = false;

    let mut result = Ok(BufferAction::Keep);

    while !done {
        match Message::parse(&read_buf[offset..]) {
            Ok(msg) => {
                // `parse` always sets `msg_size`
                offset += msg.msg_size.unwrap_or(read_buf.len() - offset);
                match msg.status {
                    MessageStatus::Call | MessageStatus::Reply => {
                        match handler(&msg) {
                            Ok(Recv::Continue) => {
                                result = Ok(BufferAction::Trim(offset));
                            }
                            Ok(Recv::Done) => {
                                result = Ok(BufferAction::Done);
                                done = true;
                            }
                            Err(e) => {
                                result = Err(e);
                                done = true;
                            }
                        }
                    }
                    MessageStatus::Error => {
                        result = serde_json::from_value(msg.data.d)
                            .or_else(|_| Err(unspecified_error().into()))
                            .and_then(|e: ServerError| Err(e.into()));

                        done = true;
                    }
                }
            }
            Err(ParseError::NotEnoughBytes(_bytes)) => {
                done = true;
            }
            Err(ParseError::IOError(e)) => {
                result = Err(e);
                done = true;
            }
        }
    }

    result
}

fn unspecified_error() -> ServerError {
    ServerError::new(
        "UnspecifiedServerError",
        "Server reported unspecified error.",
    )
}
