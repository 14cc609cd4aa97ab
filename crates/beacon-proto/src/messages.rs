// ABOUTME: Protobuf frame bodies declared with prost derive macros.
// ABOUTME: Handshake, send, request/response, command, keep-alive and close frames.

use std::collections::HashMap;

use bytes::Bytes;

/// Outcome of a handshake as decided by the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HandshakeCode {
    Unspecified = 0,
    Success = 1,
    /// Another live connection already uses the same agent identity.
    DuplicateAgent = 2,
    /// Protocol version mismatch or malformed handshake.
    ProtocolError = 3,
    /// Identity failed validation.
    Rejected = 4,
}

/// Error classes carried in a failed [`Response`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    /// No handler is registered for the command type.
    UnsupportedCommand = 1,
    /// The handler ran and failed (or panicked).
    HandlerFailed = 2,
    /// The receiving side does not accept plain requests.
    Unsupported = 3,
    Cancelled = 4,
}

/// First frame sent by the agent on a fresh connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub application_name: String,
    #[prost(string, tag = "2")]
    pub agent_id: String,
    /// Agent process start time in epoch milliseconds.
    #[prost(int64, tag = "3")]
    pub start_timestamp: i64,
    #[prost(uint32, tag = "4")]
    pub protocol_version: u32,
    /// Command types this agent can execute.
    #[prost(string, repeated, tag = "5")]
    pub supported_commands: Vec<String>,
    #[prost(map = "string, string", tag = "6")]
    pub properties: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeResponse {
    #[prost(enumeration = "HandshakeCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub server_id: String,
}

/// Fire-and-forget payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(uint32, tag = "1")]
    pub request_id: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Answer to a [`Request`] or [`Command`]. A present `error` means failure.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(uint32, tag = "1")]
    pub request_id: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ResponseError>,
}

/// Collector-initiated command executed by the agent's dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(uint32, tag = "1")]
    pub request_id: u32,
    #[prost(string, tag = "2")]
    pub command_type: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

/// Graceful close announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Envelope for everything written to the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10")]
    pub body: Option<frame::Body>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Handshake(super::Handshake),
        #[prost(message, tag = "2")]
        HandshakeResponse(super::HandshakeResponse),
        #[prost(message, tag = "3")]
        Send(super::SendMessage),
        #[prost(message, tag = "4")]
        Request(super::Request),
        #[prost(message, tag = "5")]
        Response(super::Response),
        #[prost(message, tag = "6")]
        Command(super::Command),
        #[prost(message, tag = "7")]
        Ping(super::Ping),
        #[prost(message, tag = "8")]
        Pong(super::Pong),
        #[prost(message, tag = "9")]
        ClientClose(super::Close),
        #[prost(message, tag = "10")]
        ServerClose(super::Close),
    }
}

impl Frame {
    fn with(body: frame::Body) -> Self {
        Self { body: Some(body) }
    }

    pub fn handshake(handshake: Handshake) -> Self {
        Self::with(frame::Body::Handshake(handshake))
    }

    pub fn handshake_response(
        code: HandshakeCode,
        message: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self::with(frame::Body::HandshakeResponse(HandshakeResponse {
            code: code as i32,
            message: message.into(),
            server_id: server_id.into(),
        }))
    }

    pub fn send(payload: Bytes) -> Self {
        Self::with(frame::Body::Send(SendMessage { payload }))
    }

    pub fn request(request_id: u32, payload: Bytes) -> Self {
        Self::with(frame::Body::Request(Request {
            request_id,
            payload,
        }))
    }

    pub fn response_ok(request_id: u32, payload: Bytes) -> Self {
        Self::with(frame::Body::Response(Response {
            request_id,
            payload,
            error: None,
        }))
    }

    pub fn response_err(request_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with(frame::Body::Response(Response {
            request_id,
            payload: Bytes::new(),
            error: Some(ResponseError {
                code: code as i32,
                message: message.into(),
            }),
        }))
    }

    pub fn command(request_id: u32, command_type: impl Into<String>, payload: Bytes) -> Self {
        Self::with(frame::Body::Command(Command {
            request_id,
            command_type: command_type.into(),
            payload,
        }))
    }

    pub fn ping(id: u32) -> Self {
        Self::with(frame::Body::Ping(Ping { id }))
    }

    pub fn pong(id: u32) -> Self {
        Self::with(frame::Body::Pong(Pong { id }))
    }

    pub fn client_close(reason: impl Into<String>) -> Self {
        Self::with(frame::Body::ClientClose(Close {
            reason: reason.into(),
        }))
    }

    pub fn server_close(reason: impl Into<String>) -> Self {
        Self::with(frame::Body::ServerClose(Close {
            reason: reason.into(),
        }))
    }

    /// Short name of the body, for logging.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            Some(frame::Body::Handshake(_)) => "handshake",
            Some(frame::Body::HandshakeResponse(_)) => "handshake_response",
            Some(frame::Body::Send(_)) => "send",
            Some(frame::Body::Request(_)) => "request",
            Some(frame::Body::Response(_)) => "response",
            Some(frame::Body::Command(_)) => "command",
            Some(frame::Body::Ping(_)) => "ping",
            Some(frame::Body::Pong(_)) => "pong",
            Some(frame::Body::ClientClose(_)) => "client_close",
            Some(frame::Body::ServerClose(_)) => "server_close",
            None => "empty",
        }
    }
}

impl Response {
    /// Decoded error code, falling back to `Unknown` for values this build does not know.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error
            .as_ref()
            .map(|e| ErrorCode::try_from(e.code).unwrap_or(ErrorCode::Unknown))
    }
}
