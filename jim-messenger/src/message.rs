//! JIM wire protocol: typed frames plus the length-prefixed JSON codec.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by a JSON
//! object of at most [`MAX_PACKAGE_LENGTH`] bytes. Requests are discriminated
//! by their `action` key, responses by their numeric `response` code; the
//! key names match the JIM protocol so existing peers interoperate.

use bytes::{Buf, BufMut, BytesMut};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, TransportError};

/// Largest JSON body accepted in either direction.
pub const MAX_PACKAGE_LENGTH: usize = 1024;

const HEADER_LEN: usize = 4;
const ACTION_KEY: &str = "action";
const RESPONSE_KEY: &str = "response";
const ACTIONS: &[&str] = &[
    "presence",
    "message",
    "exit",
    "get_contacts",
    "add",
    "remove",
    "get_users",
];

/// Client-originated requests. Every variant carries the send time in Unix
/// seconds; routed chat messages reuse [`Request::Message`] verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Presence {
        time: f64,
        user: Account,
    },
    Message {
        #[serde(rename = "from")]
        sender: String,
        #[serde(rename = "to")]
        destination: String,
        time: f64,
        #[serde(rename = "mess_text")]
        text: String,
    },
    Exit {
        time: f64,
        account_name: String,
    },
    GetContacts {
        time: f64,
        user: String,
    },
    #[serde(rename = "add")]
    AddContact {
        time: f64,
        user: String,
        account_name: String,
    },
    #[serde(rename = "remove")]
    RemoveContact {
        time: f64,
        user: String,
        account_name: String,
    },
    GetUsers {
        time: f64,
        account_name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_name: String,
}

impl Request {
    pub fn presence(name: impl Into<String>) -> Self {
        Request::Presence {
            time: timestamp(),
            user: Account {
                account_name: name.into(),
            },
        }
    }

    pub fn message(
        sender: impl Into<String>,
        destination: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Request::Message {
            sender: sender.into(),
            destination: destination.into(),
            time: timestamp(),
            text: text.into(),
        }
    }

    pub fn exit(name: impl Into<String>) -> Self {
        Request::Exit {
            time: timestamp(),
            account_name: name.into(),
        }
    }

    pub fn get_contacts(user: impl Into<String>) -> Self {
        Request::GetContacts {
            time: timestamp(),
            user: user.into(),
        }
    }

    pub fn add_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Request::AddContact {
            time: timestamp(),
            user: user.into(),
            account_name: contact.into(),
        }
    }

    pub fn remove_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Request::RemoveContact {
            time: timestamp(),
            user: user.into(),
            account_name: contact.into(),
        }
    }

    pub fn get_users(name: impl Into<String>) -> Self {
        Request::GetUsers {
            time: timestamp(),
            account_name: name.into(),
        }
    }

    /// The wire name of this request's action.
    pub fn action(&self) -> &'static str {
        match self {
            Request::Presence { .. } => "presence",
            Request::Message { .. } => "message",
            Request::Exit { .. } => "exit",
            Request::GetContacts { .. } => "get_contacts",
            Request::AddContact { .. } => "add",
            Request::RemoveContact { .. } => "remove",
            Request::GetUsers { .. } => "get_users",
        }
    }
}

/// Server answers: 200 (ok), 202 (ok with a list) and 400 (error text).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub enum Response {
    Ok,
    Accepted(Vec<String>),
    Error(String),
}

impl Response {
    pub fn code(&self) -> u16 {
        match self {
            Response::Ok => 200,
            Response::Accepted(_) => 202,
            Response::Error(_) => 400,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Response::Error(text.into())
    }
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    response: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<RawResponse> for Response {
    type Error = ProtocolError;

    fn try_from(raw: RawResponse) -> Result<Self, ProtocolError> {
        match raw.response {
            200 => Ok(Response::Ok),
            202 => raw
                .data_list
                .map(Response::Accepted)
                .ok_or(ProtocolError::MissingPayload {
                    code: 202,
                    field: "data_list",
                }),
            400 => raw.error.map(Response::Error).ok_or(ProtocolError::MissingPayload {
                code: 400,
                field: "error",
            }),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        let code = response.code();
        let (data_list, error) = match response {
            Response::Ok => (None, None),
            Response::Accepted(list) => (Some(list), None),
            Response::Error(text) => (None, Some(text)),
        };
        RawResponse {
            response: code,
            data_list,
            error,
        }
    }
}

/// One complete protocol unit in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Frame::Request(request)
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Frame::Response(response)
    }
}

impl Frame {
    /// Parses one JSON body. Total: any input that is not exactly one of the
    /// known frame shapes is a [`ProtocolError`].
    pub fn from_json(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)?;
        let action = match &value {
            Value::Object(fields) if fields.contains_key(ACTION_KEY) => {
                Some(fields[ACTION_KEY].as_str().map(str::to_owned))
            }
            Value::Object(fields) if fields.contains_key(RESPONSE_KEY) => None,
            Value::Object(_) => return Err(ProtocolError::MissingDiscriminator),
            _ => return Err(ProtocolError::NotAnObject),
        };

        match action {
            Some(Some(name)) if ACTIONS.contains(&name.as_str()) => {
                Ok(Frame::Request(serde_json::from_value(value)?))
            }
            Some(Some(name)) => Err(ProtocolError::UnknownAction(name)),
            Some(None) => Err(ProtocolError::UnknownAction(value[ACTION_KEY].to_string())),
            None => Ok(Frame::Response(serde_json::from_value(value)?)),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Frame::Request(request) => serde_json::to_vec(request)?,
            Frame::Response(response) => serde_json::to_vec(response)?,
        };
        Ok(body)
    }
}

/// Encodes a frame as length prefix plus JSON body.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = frame.to_json()?;
    if body.len() > MAX_PACKAGE_LENGTH {
        return Err(ProtocolError::Oversized { len: body.len() });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a byte sequence that must hold exactly one frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buffer = BytesMut::from(bytes);
    match decode_from(&mut buffer)? {
        Some(frame) if buffer.is_empty() => Ok(frame),
        Some(_) => Err(ProtocolError::TrailingBytes(buffer.len())),
        None => Err(ProtocolError::Truncated),
    }
}

/// Pulls the next complete frame off the front of `buffer`.
///
/// Returns `Ok(None)` while the frame is still incomplete; the buffer is
/// left untouched in that case so more bytes can be appended.
pub fn decode_from(buffer: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = (&buffer[..HEADER_LEN]).get_u32() as usize;
    if len > MAX_PACKAGE_LENGTH {
        return Err(ProtocolError::Oversized { len });
    }
    if buffer.len() < HEADER_LEN + len {
        buffer.reserve(HEADER_LEN + len - buffer.len());
        return Ok(None);
    }

    buffer.advance(HEADER_LEN);
    let body = buffer.split_to(len);
    Frame::from_json(&body).map(Some)
}

/// Whether `buffer` already starts with a whole frame, or with a header
/// that can only decode to an error.
pub fn frame_complete(buffer: &[u8]) -> bool {
    if buffer.len() < HEADER_LEN {
        return false;
    }
    let len = (&buffer[..HEADER_LEN]).get_u32() as usize;
    len > MAX_PACKAGE_LENGTH || buffer.len() >= HEADER_LEN + len
}

/// Current wall-clock time in Unix seconds, as carried in `time` fields.
pub fn timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A byte stream with a frame-sized read buffer.
///
/// `read_frame` only ever awaits `read_buf`, so dropping it mid-frame (for
/// example under `tokio::time::timeout`) keeps the partial bytes for the
/// next call.
pub struct FrameStream<S> {
    io: S,
    buffer: BytesMut,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            buffer: BytesMut::with_capacity(HEADER_LEN + MAX_PACKAGE_LENGTH),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = decode_from(&mut self.buffer)? {
                return Ok(frame);
            }
            if self.io.read_buf(&mut self.buffer).await? == 0 {
                return Err(if self.buffer.is_empty() {
                    TransportError::Closed
                } else {
                    ProtocolError::Truncated.into()
                });
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let encoded = encode(frame)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }
}
