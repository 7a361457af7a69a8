//! Bidirectional session pumps
//!
//! Two concurrent forwarders share one session. The H3→backend pump owns
//! the read side of the HTTP/3 request stream and reassembles fragmented
//! messages before flushing them to the backend as single writes; the
//! backend→H3 pump owns the backend read side and re-frames messages onto
//! the request stream. Each pump additionally writes control frames to the
//! side it otherwise only reads, so both write sides sit behind a mutex:
//! frames may interleave only at frame boundaries.
//!
//! The H3 read has no per-read deadline (the QUIC idle timeout covers
//! liveness there); the backend read carries `read_timeout`. All writes
//! carry `write_timeout`, except backend-bound control frames which use a
//! fixed 5-second deadline.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendSink, BackendSource};
use crate::config::Limits;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{self, Frame, OpCode};
use crate::metrics;

/// Write deadline for control frames forwarded to the backend
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reassembles fragmented data messages read from the H3 stream.
///
/// `assembling` is true iff a non-final TEXT/BINARY frame has been received
/// and its closing continuation has not yet arrived.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    assembling: bool,
    opcode: u8,
    payload: BytesMut,
}

impl Assembler {
    /// Feed a TEXT or BINARY frame. Returns the completed message, if any.
    pub(crate) fn data(&mut self, frame: &Frame, max_message: u64) -> Result<Option<(u8, Bytes)>> {
        if self.assembling {
            return Err(Error::Protocol("new data frame while assembling"));
        }
        if frame.fin {
            if frame.payload.len() as u64 > max_message {
                return Err(Error::MessageTooLarge);
            }
            return Ok(Some((frame.opcode, frame.payload.clone())));
        }
        self.assembling = true;
        self.opcode = frame.opcode;
        self.payload.clear();
        self.payload.extend_from_slice(&frame.payload);
        if self.payload.len() as u64 > max_message {
            return Err(Error::MessageTooLarge);
        }
        Ok(None)
    }

    /// Feed a CONT frame. Returns the completed message, if any.
    pub(crate) fn continuation(
        &mut self,
        frame: &Frame,
        max_message: u64,
    ) -> Result<Option<(u8, Bytes)>> {
        if !self.assembling {
            return Err(Error::Protocol("continuation without start"));
        }
        self.payload.extend_from_slice(&frame.payload);
        if self.payload.len() as u64 > max_message {
            return Err(Error::MessageTooLarge);
        }
        if frame.fin {
            self.assembling = false;
            return Ok(Some((self.opcode, self.payload.split().freeze())));
        }
        Ok(None)
    }
}

/// H3 → backend: decode frames off the request stream, reassemble, flush.
pub async fn pump_h3_to_backend<R, W>(
    cancel: CancellationToken,
    h3_reader: R,
    h3_writer: Arc<Mutex<W>>,
    backend: Arc<Mutex<BackendSink>>,
    limits: Limits,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(h3_reader);
    let mut assembler = Assembler::default();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = frame::read_frame(&mut reader, limits.max_frame_size) => res?,
        };

        match OpCode::from_u8(frame.opcode) {
            Some(OpCode::Text) | Some(OpCode::Binary) => {
                let completed = assembler.data(&frame, limits.max_message_size);
                dispatch_assembled(completed, &h3_writer, &backend, &limits).await?;
            }
            Some(OpCode::Continuation) => {
                let completed = assembler.continuation(&frame, limits.max_message_size);
                dispatch_assembled(completed, &h3_writer, &backend, &limits).await?;
            }
            Some(OpCode::Ping) => {
                metrics::control_frame("ping");
                // reply locally, and let the backend see the liveness probe too
                write_h3_control(
                    &h3_writer,
                    OpCode::Pong as u8,
                    &frame.payload,
                    limits.write_timeout,
                )
                .await?;
                let _ =
                    send_backend_control(&backend, Message::Ping(frame.payload.clone().into()))
                        .await;
            }
            Some(OpCode::Pong) => {
                metrics::control_frame("pong");
                // pongs are responses, not requests: forward, don't acknowledge
                let _ =
                    send_backend_control(&backend, Message::Pong(frame.payload.clone().into()))
                        .await;
            }
            Some(OpCode::Close) => {
                metrics::control_frame("close");
                let (code, reason) = frame::parse_close(&frame.payload);
                let close = CloseFrame {
                    code: code.into(),
                    reason: reason.clone().into(),
                };
                let _ = send_backend_control(&backend, Message::Close(Some(close))).await;
                let _ = write_close_to_h3(&h3_writer, code, &reason, limits.write_timeout).await;
                return Ok(());
            }
            None => {} // reserved opcode: ignore
        }
    }
}

/// Handle the outcome of feeding a data/continuation frame to the assembler.
async fn dispatch_assembled<W>(
    completed: Result<Option<(u8, Bytes)>>,
    h3_writer: &Mutex<W>,
    backend: &Mutex<BackendSink>,
    limits: &Limits,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match completed {
        Ok(Some((opcode, payload))) => flush_to_backend(backend, opcode, payload, limits).await,
        Ok(None) => Ok(()),
        Err(Error::MessageTooLarge) => {
            metrics::oversize_drop("message");
            let _ = write_close_to_h3(
                h3_writer,
                CloseReason::TOO_BIG,
                "message too big",
                limits.write_timeout,
            )
            .await;
            Err(Error::MessageTooLarge)
        }
        Err(e) => Err(e), // protocol violation: the peer is misbehaving, no close owed
    }
}

/// Forward one reassembled message to the backend as a single write.
async fn flush_to_backend(
    sink: &Mutex<BackendSink>,
    opcode: u8,
    payload: Bytes,
    limits: &Limits,
) -> Result<()> {
    let message = match OpCode::from_u8(opcode) {
        Some(OpCode::Text) => {
            metrics::data_message("h3_to_h1", "text", payload.len());
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| Error::Protocol("invalid utf-8 in text message"))?;
            Message::Text(text.into())
        }
        Some(OpCode::Binary) => {
            metrics::data_message("h3_to_h1", "binary", payload.len());
            Message::Binary(payload.into())
        }
        _ => return Ok(()),
    };

    let mut sink = sink.lock().await;
    timeout(limits.write_timeout, sink.send(message))
        .await
        .map_err(Error::from)?
        .map_err(Error::from)
}

/// backend → H3: read whole messages off the backend, re-frame onto H3.
pub async fn pump_backend_to_h3<W>(
    cancel: CancellationToken,
    mut backend: BackendSource,
    backend_sink: Arc<Mutex<BackendSink>>,
    h3_writer: Arc<Mutex<W>>,
    limits: Limits,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = timeout(limits.read_timeout, backend.next()) => res,
        };

        let message = match next {
            Err(_elapsed) => {
                let _ = write_close_to_h3(
                    &h3_writer,
                    CloseReason::INTERNAL,
                    "backend read error",
                    limits.write_timeout,
                )
                .await;
                return Err(Error::Timeout);
            }
            Ok(None) => {
                let _ = write_close_to_h3(
                    &h3_writer,
                    CloseReason::INTERNAL,
                    "backend read error",
                    limits.write_timeout,
                )
                .await;
                return Err(Error::ConnectionClosed);
            }
            Ok(Some(Err(e))) => {
                let err = Error::from(e);
                match err {
                    Error::MessageTooLarge => {
                        metrics::oversize_drop("message");
                        let _ = write_close_to_h3(
                            &h3_writer,
                            CloseReason::TOO_BIG,
                            "message too big",
                            limits.write_timeout,
                        )
                        .await;
                    }
                    _ => {
                        let _ = write_close_to_h3(
                            &h3_writer,
                            CloseReason::INTERNAL,
                            "backend read error",
                            limits.write_timeout,
                        )
                        .await;
                    }
                }
                return Err(err);
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() as u64 > limits.max_message_size {
                    metrics::oversize_drop("message");
                    let _ = write_close_to_h3(
                        &h3_writer,
                        CloseReason::TOO_BIG,
                        "message too big",
                        limits.write_timeout,
                    )
                    .await;
                    return Err(Error::MessageTooLarge);
                }
                metrics::data_message("h1_to_h3", "text", text.len());
                write_h3_data(&h3_writer, OpCode::Text as u8, text.as_bytes(), &limits).await?;
            }
            Message::Binary(data) => {
                if data.len() as u64 > limits.max_message_size {
                    metrics::oversize_drop("message");
                    let _ = write_close_to_h3(
                        &h3_writer,
                        CloseReason::TOO_BIG,
                        "message too big",
                        limits.write_timeout,
                    )
                    .await;
                    return Err(Error::MessageTooLarge);
                }
                metrics::data_message("h1_to_h3", "binary", data.len());
                write_h3_data(&h3_writer, OpCode::Binary as u8, &data, &limits).await?;
            }
            Message::Ping(data) => {
                metrics::control_frame("ping");
                write_h3_control(&h3_writer, OpCode::Ping as u8, &data, limits.write_timeout)
                    .await?;
                let _ = send_backend_control(&backend_sink, Message::Pong(data)).await;
            }
            Message::Pong(data) => {
                metrics::control_frame("pong");
                write_h3_control(&h3_writer, OpCode::Pong as u8, &data, limits.write_timeout)
                    .await?;
            }
            Message::Close(close) => {
                metrics::control_frame("close");
                let reason = close
                    .map(|c| CloseReason::new(u16::from(c.code), c.reason.to_string()))
                    .unwrap_or_else(|| CloseReason::new(CloseReason::NORMAL, ""));
                let _ = write_close_to_h3(
                    &h3_writer,
                    reason.code,
                    &reason.reason,
                    limits.write_timeout,
                )
                .await;
                return Err(Error::Closed(Some(reason)));
            }
            Message::Frame(_) => {} // raw frames never surface from a read
        }
    }
}

/// Write one data frame (fragmenting per `max_frame_size`) to the shared H3
/// writer. The lock spans the whole fragmented write so no other frame can
/// interleave inside a logical message.
async fn write_h3_data<W>(writer: &Mutex<W>, opcode: u8, payload: &[u8], limits: &Limits) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    timeout(
        limits.write_timeout,
        frame::write_data_frame(&mut *w, opcode, payload, false, limits.max_frame_size),
    )
    .await
    .map_err(Error::from)?
}

async fn write_h3_control<W>(
    writer: &Mutex<W>,
    opcode: u8,
    payload: &[u8],
    deadline: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    timeout(deadline, frame::write_control_frame(&mut *w, opcode, payload))
        .await
        .map_err(Error::from)?
}

/// Write a close frame to the shared H3 writer.
pub(crate) async fn write_close_to_h3<W>(
    writer: &Mutex<W>,
    code: u16,
    reason: &str,
    deadline: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    timeout(deadline, frame::write_close_frame(&mut *w, code, reason))
        .await
        .map_err(Error::from)?
}

async fn send_backend_control(sink: &Mutex<BackendSink>, message: Message) -> Result<()> {
    let mut sink = sink.lock().await;
    timeout(CONTROL_WRITE_TIMEOUT, sink.send(message))
        .await
        .map_err(Error::from)?
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode: opcode as u8,
            masked: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = Assembler::default();
        let out = assembler
            .data(&data_frame(OpCode::Text, true, b"hello"), 1024)
            .unwrap();
        let (opcode, payload) = out.unwrap();
        assert_eq!(opcode, OpCode::Text as u8);
        assert_eq!(payload.as_ref(), b"hello");
        assert!(!assembler.assembling);
    }

    #[test]
    fn test_fragmented_reassembly() {
        let mut assembler = Assembler::default();
        assert!(assembler
            .data(&data_frame(OpCode::Binary, false, &[0x01, 0x02]), 1024)
            .unwrap()
            .is_none());
        assert!(assembler
            .continuation(&data_frame(OpCode::Continuation, false, &[0x03]), 1024)
            .unwrap()
            .is_none());
        let out = assembler
            .continuation(&data_frame(OpCode::Continuation, true, &[0x04, 0x05]), 1024)
            .unwrap();
        let (opcode, payload) = out.unwrap();
        assert_eq!(opcode, OpCode::Binary as u8);
        assert_eq!(payload.as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert!(!assembler.assembling);
    }

    #[test]
    fn test_cumulative_limit() {
        // "ab" + "cd" + "e" against a 4-byte limit: fails on the third frame
        let mut assembler = Assembler::default();
        assert!(assembler
            .data(&data_frame(OpCode::Text, false, b"ab"), 4)
            .unwrap()
            .is_none());
        assert!(assembler
            .continuation(&data_frame(OpCode::Continuation, false, b"cd"), 4)
            .unwrap()
            .is_none());
        let err = assembler
            .continuation(&data_frame(OpCode::Continuation, true, b"e"), 4)
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn test_single_frame_over_limit() {
        let mut assembler = Assembler::default();
        let err = assembler
            .data(&data_frame(OpCode::Binary, true, &[0u8; 8]), 4)
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn test_first_fragment_over_limit() {
        let mut assembler = Assembler::default();
        let err = assembler
            .data(&data_frame(OpCode::Binary, false, &[0u8; 8]), 4)
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn test_continuation_without_start() {
        let mut assembler = Assembler::default();
        let err = assembler
            .continuation(&data_frame(OpCode::Continuation, true, b"x"), 1024)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol("continuation without start")));
    }

    #[test]
    fn test_data_frame_while_assembling() {
        let mut assembler = Assembler::default();
        assembler
            .data(&data_frame(OpCode::Text, false, b"part"), 1024)
            .unwrap();
        let err = assembler
            .data(&data_frame(OpCode::Text, true, b"next"), 1024)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol("new data frame while assembling")
        ));
    }

    #[test]
    fn test_assembler_reusable_after_message() {
        let mut assembler = Assembler::default();
        assembler
            .data(&data_frame(OpCode::Text, false, b"one"), 1024)
            .unwrap();
        assembler
            .continuation(&data_frame(OpCode::Continuation, true, b" two"), 1024)
            .unwrap()
            .unwrap();
        // a new message can start afterwards
        let out = assembler
            .data(&data_frame(OpCode::Binary, true, b"three"), 1024)
            .unwrap();
        assert_eq!(out.unwrap().1.as_ref(), b"three");
    }

    #[tokio::test]
    async fn test_write_close_to_h3_serialized() {
        let writer = Mutex::new(Vec::new());
        write_close_to_h3(&writer, 1009, "message too big", Duration::from_secs(1))
            .await
            .unwrap();

        let buf = writer.into_inner();
        let mut cursor = &buf[..];
        let frame = frame::read_frame(&mut cursor, 0).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close as u8);
        let (code, reason) = frame::parse_close(&frame.payload);
        assert_eq!(code, 1009);
        assert_eq!(reason, "message too big");
    }
}
