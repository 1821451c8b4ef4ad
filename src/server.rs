// Copyright 2021 Stratus Data Systems, Inc.

//! The dispatcher half of the transport. The parent daemon accepts a TCP
//! connection and hands it here; the dispatcher owns the thread, decoding
//! frames and dispatching procedures against the session until the peer
//! disconnects or the session becomes unusable.
//!
//! Only the subscription handshake is synchronous. Every other procedure is
//! a one-way call: no reply is ever generated for it, which is what lets a
//! client transport share this same socket once the handshake completes.

use std::io::{Read, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, o, warn, Drain, Logger};

use crate::error::EngineError;
use crate::protocol;
use crate::protocol::{
    proc, Message, MessageData, MessageStatus, ServerError,
};
use crate::session::Session;
use crate::types::{BacklogSpec, SubscriptionRequest};

const READ_CHUNK_SZ: usize = 2048;

/// Serves one accepted connection to completion: until the peer hangs up,
/// the session is marked done, or the transport fails.
pub fn serve_connection(
    stream: TcpStream,
    session: &mut Session,
    log: Option<&Logger>,
) -> Result<(), EngineError> {
    // If no logger was provided use the slog StdLog drain by default
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    let mut buf = BytesMut::new();
    let mut chunk = [0u8; READ_CHUNK_SZ];

    loop {
        let nread = (&stream).read(&mut chunk)?;
        if nread == 0 {
            debug!(log, "peer closed the connection");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..nread]);

        if let Some(msgs) = protocol::decode_buf(&mut buf)? {
            for msg in msgs {
                dispatch(&stream, session, &msg, &log)?;
                if session.is_done() {
                    debug!(log, "session done; draining connection");
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch(
    stream: &TcpStream,
    session: &mut Session,
    msg: &Message,
    log: &Logger,
) -> Result<(), EngineError> {
    if msg.status != MessageStatus::Call {
        warn!(log, "ignoring non-call message"; "id" => msg.id);
        return Ok(());
    }

    if !msg.data.m.matches_protocol() {
        warn!(log, "peer speaks a different protocol";
            "prog" => msg.data.m.prog, "vers" => msg.data.m.vers);
        send_error(
            stream,
            msg.id,
            &msg.data.m.name,
            "ProtocolMismatch",
            "unsupported program or version",
        )?;
        session.mark_done();
        return Ok(());
    }

    match msg.data.m.name.as_str() {
        proc::SUBSCRIBE => {
            let request: SubscriptionRequest = match parse_one_arg(msg) {
                Ok(request) => request,
                Err(e) => {
                    warn!(log, "{}", e);
                    send_error(
                        stream,
                        msg.id,
                        &msg.data.m.name,
                        "BadArguments",
                        &e.to_string(),
                    )?;
                    session.mark_done();
                    return Ok(());
                }
            };

            match session.handle_subscribe(&request, stream) {
                Some(reply) => {
                    let d = serde_json::to_value(&reply)
                        .map_err(|e| EngineError::System(e.to_string()))?;
                    let data = MessageData::new(
                        String::from(proc::SUBSCRIBE),
                        Value::Array(vec![d]),
                    );
                    write_msg(stream, &Message::reply(msg.id, data))?;
                }
                None => {
                    // The session produced no reply; send a generic system
                    // error in its place and stop serving.
                    send_error(
                        stream,
                        msg.id,
                        &msg.data.m.name,
                        "SystemError",
                        "subscription failed",
                    )?;
                    session.mark_done();
                }
            }
        }
        proc::REQUEST_PRODUCT => match parse_one_arg::<u64>(msg) {
            Ok(index) => session.handle_request_product(index),
            Err(e) => {
                // One-way procedure: nothing to reply to
                warn!(log, "{}", e);
                session.mark_done();
            }
        },
        proc::REQUEST_BACKLOG => match parse_one_arg::<BacklogSpec>(msg) {
            Ok(spec) => session.handle_request_backlog(&spec),
            Err(e) => {
                warn!(log, "{}", e);
                session.mark_done();
            }
        },
        proc::TEST_CONNECTION => {
            debug!(log, "connection probe");
        }
        name => {
            warn!(log, "unsupported procedure"; "name" => name);
            send_error(
                stream,
                msg.id,
                name,
                "UnsupportedProcedure",
                &format!("Unsupported procedure: {}", name),
            )?;
        }
    }

    Ok(())
}

fn parse_one_arg<T: DeserializeOwned>(msg: &Message) -> Result<T, EngineError> {
    let mut args: Vec<T> =
        serde_json::from_value(msg.data.d.clone()).map_err(|e| {
            EngineError::Inval(format!(
                "bad arguments for {}: {}",
                msg.data.m.name, e
            ))
        })?;
    if args.len() != 1 {
        return Err(EngineError::Inval(format!(
            "expected exactly one argument for {}, got {}",
            msg.data.m.name,
            args.len()
        )));
    }
    Ok(args.remove(0))
}

fn send_error(
    stream: &TcpStream,
    msg_id: u32,
    method: &str,
    name: &str,
    message: &str,
) -> Result<(), EngineError> {
    let d = serde_json::to_value(&ServerError::new(name, message))
        .map_err(|e| EngineError::System(e.to_string()))?;
    let data = MessageData::new(String::from(method), d);
    write_msg(stream, &Message::error(msg_id, data))
}

fn write_msg(
    mut stream: &TcpStream,
    msg: &Message,
) -> Result<(), EngineError> {
    let mut write_buf = BytesMut::new();
    protocol::encode_msg(msg, &mut write_buf).map_err(EngineError::System)?;
    stream.write_all(&write_buf)?;
    Ok(())
}
