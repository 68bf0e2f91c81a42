//! One side of a relay: a frame source and a frame sink
//!
//! The inbound side is an axum `WebSocket`, the backend side a tokio-tungstenite
//! stream. Both are adapted to the same boxed `Stream`/`Sink` pair so the relay
//! loop does not care which library produced them.
//!
//! Ping and pong frames are answered by each library on its own hop and never
//! reach the relay. A received close frame surfaces as [`FrameError::Close`].

use axum::extract::ws::{self as axum_ws, WebSocket};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::frame::{CloseFrame, Frame, FrameError, CLOSE_NO_STATUS};

pub type FrameSource = BoxStream<'static, Result<Frame, FrameError>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = FrameError> + Send>>;

pub struct Endpoint {
    pub source: FrameSource,
    pub sink: FrameSink,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn new<St, Si>(source: St, sink: Si) -> Self
    where
        St: Stream<Item = Result<Frame, FrameError>> + Send + 'static,
        Si: Sink<Frame, Error = FrameError> + Send + 'static,
    {
        Self {
            source: source.boxed(),
            sink: Box::pin(sink),
        }
    }

    /// Inbound (client-facing) side
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split::<axum_ws::Message>();

        let source = stream.filter_map(|result| {
            future::ready(match result {
                Ok(message) => from_axum_message(message),
                Err(e) => Some(Err(FrameError::Transport(e.to_string()))),
            })
        });

        let sink = sink
            .sink_map_err(|e| FrameError::Transport(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, FrameError>(to_axum_message(frame))));

        Self::new(source, sink)
    }

    /// Backend side
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split::<Message>();

        let source = stream.filter_map(|result| {
            future::ready(match result {
                Ok(message) => from_tungstenite_message(message),
                Err(e) => Some(Err(from_tungstenite_error(e))),
            })
        });

        let sink = sink.sink_map_err(from_tungstenite_error).with(|frame: Frame| {
            future::ready(Ok::<_, FrameError>(to_tungstenite_message(frame)))
        });

        Self::new(source, sink)
    }
}

fn from_axum_message(message: axum_ws::Message) -> Option<Result<Frame, FrameError>> {
    match message {
        axum_ws::Message::Text(text) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        axum_ws::Message::Binary(data) => Some(Ok(Frame::Binary(data))),
        axum_ws::Message::Ping(_) | axum_ws::Message::Pong(_) => None,
        axum_ws::Message::Close(Some(close)) => Some(Err(FrameError::close(
            close.code,
            close.reason.as_str(),
        ))),
        axum_ws::Message::Close(None) => Some(Err(FrameError::close(CLOSE_NO_STATUS, ""))),
    }
}

fn to_axum_message(frame: Frame) -> axum_ws::Message {
    match frame {
        Frame::Text(text) => axum_ws::Message::Text(text.into()),
        Frame::Binary(data) => axum_ws::Message::Binary(data),
        Frame::Close(CloseFrame { code, reason }) => {
            axum_ws::Message::Close(Some(axum_ws::CloseFrame {
                code,
                reason: reason.into(),
            }))
        }
    }
}

fn from_tungstenite_message(message: Message) -> Option<Result<Frame, FrameError>> {
    match message {
        Message::Text(text) => Some(Ok(Frame::Text(text))),
        Message::Binary(data) => Some(Ok(Frame::Binary(Bytes::from(data)))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        Message::Close(Some(close)) => Some(Err(FrameError::close(
            u16::from(close.code),
            close.reason.into_owned(),
        ))),
        Message::Close(None) => Some(Err(FrameError::close(CLOSE_NO_STATUS, ""))),
    }
}

fn to_tungstenite_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Close(CloseFrame { code, reason }) => Message::Close(Some(WsCloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_tungstenite_error(err: tungstenite::Error) -> FrameError {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            FrameError::unexpected_eof()
        }
        other => FrameError::Transport(other.to_string()),
    }
}
