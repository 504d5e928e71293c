//! Message types for the mesh wire protocol.
//!
//! Each frame type carries a JSON header whose schema lives next to its tag
//! byte. Headers use PascalCase field names on the wire; 64-bit transaction
//! numbers and error codes are serialized as decimal strings, and empty or
//! zero-valued fields are omitted. Unknown header fields are ignored on
//! decode for forward compatibility. Every header type carries its own
//! `validate` function for the fields the engine cannot operate without.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    codec::Frame,
    error::{ErrCode, NetError},
};

/// Frame type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Handshake request from the dialing side.
    Connect,
    /// Handshake verdict from the accepting side.
    Accept,
    /// Liveness probe; the only frame without a body section.
    Ping,
    /// One-way shutdown notice.
    Die,
    /// Application request.
    Request,
    /// Application response.
    Response,
}

impl MsgType {
    /// Wire tag byte for this frame type.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Connect => b'C',
            Self::Accept => b'A',
            Self::Ping => b'P',
            Self::Die => b'D',
            Self::Request => b'S',
            Self::Response => b'R',
        }
    }

    /// Map a wire byte back onto a frame type, if recognised.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'C' => Some(Self::Connect),
            b'A' => Some(Self::Accept),
            b'P' => Some(Self::Ping),
            b'D' => Some(Self::Die),
            b'S' => Some(Self::Request),
            b'R' => Some(Self::Response),
            _ => None,
        }
    }

    /// True for the one frame type that carries no body section.
    #[must_use]
    pub const fn is_headers_only(self) -> bool {
        matches!(self, Self::Ping)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "Connect",
            Self::Accept => "Accept",
            Self::Ping => "Ping",
            Self::Die => "Die",
            Self::Request => "Request",
            Self::Response => "Response",
        };
        f.write_str(name)
    }
}

/// Description of the local entity announced during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Topology {
    /// Service provider name this entity belongs to.
    pub spn: String,
    /// Body field hashed by dispatchers to shard requests, if federated.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub federated_key: String,
    /// Apis served through the grid registry, if federated.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub federated_apis: Vec<String>,
}

impl Topology {
    /// True when this entity is a shard of a federated service.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        !self.federated_key.is_empty()
    }
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Header of a `Connect` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnHeader {
    /// Entity id of the dialing process.
    pub eid: String,
    /// Whether the dialer is a shard of a federated service.
    #[serde(skip_serializing_if = "is_false")]
    pub federated: bool,
}

impl ConnHeader {
    /// Check required fields.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the entity id is missing.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.eid.is_empty() {
            return Err(NetError::parsing("Connect header missing Eid"));
        }
        Ok(())
    }
}

/// Header of an `Accept` frame. A zero `ErrCode` admits the peer.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AcceptHeader {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub err_code: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err_text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err_issue: String,
}

impl AcceptHeader {
    /// Build an accept verdict from an error value; `Success` admits.
    #[must_use]
    pub fn from_error(err: &NetError) -> Self {
        if err.is_success() {
            return Self::default();
        }
        Self {
            err_code: err.code.as_u32(),
            err_text: err.text.clone(),
            err_issue: err.issue.clone(),
        }
    }

    /// Interpret the verdict as an error value.
    #[must_use]
    pub fn to_net_error(&self) -> NetError {
        NetError::with_issue(
            ErrCode::from_u32(self.err_code),
            self.err_text.clone(),
            self.err_issue.clone(),
        )
    }
}

/// Header of a `Ping` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingHeader {
    /// Entity id of the sender.
    pub eid: String,
}

impl PingHeader {
    /// Check required fields.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the entity id is missing.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.eid.is_empty() {
            return Err(NetError::parsing("Ping header missing Eid"));
        }
        Ok(())
    }
}

/// Header of a `Die` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DieHeader {
    /// Entity id of the departing process.
    pub eid: String,
}

impl DieHeader {
    /// Check required fields.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the entity id is missing.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.eid.is_empty() {
            return Err(NetError::parsing("Die header missing Eid"));
        }
        Ok(())
    }
}

/// Header of a `Request` frame.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReqHeader {
    /// Target service provider name.
    pub spn: String,
    /// Target api name.
    pub api: String,
    /// Federation key value, set by the dispatcher that sharded the call.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Originator-assigned correlation number.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub txn_no: u64,
    /// External correlation number, passed through untouched.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub ext_txn_no: u64,
    /// Exact target entity, set when forwarding to a chosen owner.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub to_eid: String,
    /// Path stack; each forwarder pushes its own Eid before relaying.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from_eids: Vec<String>,
}

impl ReqHeader {
    /// Check required fields.
    ///
    /// # Errors
    /// Returns a `Parsing` error if Spn, Api, or TxnNo are missing.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.spn.is_empty() {
            return Err(NetError::parsing("Request header missing Spn"));
        }
        if self.api.is_empty() {
            return Err(NetError::parsing("Request header missing Api"));
        }
        if self.txn_no == 0 {
            return Err(NetError::parsing("Request header missing TxnNo"));
        }
        Ok(())
    }
}

/// Header of a `Response` frame.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResHeader {
    /// Correlation number copied from the request.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub txn_no: u64,
    /// External correlation number copied from the request.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub ext_txn_no: u64,
    /// Residual return path; the next hop pops its own entry.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to_eids: Vec<String>,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub err_code: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err_text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err_issue: String,
}

impl ResHeader {
    /// Check required fields.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the TxnNo is missing.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.txn_no == 0 {
            return Err(NetError::parsing("Response header missing TxnNo"));
        }
        Ok(())
    }

    /// Stamp an error verdict onto the header.
    pub fn set_error(&mut self, err: &NetError) {
        self.err_code = err.code.as_u32();
        self.err_text = err.text.clone();
        self.err_issue = err.issue.clone();
    }

    /// Read the header's verdict as an error value.
    #[must_use]
    pub fn to_net_error(&self) -> NetError {
        NetError::with_issue(
            ErrCode::from_u32(self.err_code),
            self.err_text.clone(),
            self.err_issue.clone(),
        )
    }

    /// True when the header carries no error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.err_code == 0
    }
}

/// A decoded application request as handlers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMsg {
    /// Routing header.
    pub header: ReqHeader,
    /// Opaque JSON body; the engine reads at most the federation key field.
    pub body: Value,
}

impl RequestMsg {
    /// Decode a request from a frame's header and body bytes.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the JSON is malformed or required
    /// header fields are missing.
    pub fn from_frame(frame: &Frame) -> Result<Self, NetError> {
        let header: ReqHeader = serde_json::from_slice(&frame.header)?;
        header.validate()?;
        let body: Value = serde_json::from_slice(&frame.body)?;
        Ok(Self { header, body })
    }

    /// Deserialize the body into a typed value.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the body does not match `T`.
    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A decoded application response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMsg {
    /// Correlation header, possibly carrying an error verdict.
    pub header: ResHeader,
    /// Opaque JSON body; empty object on error responses.
    pub body: Value,
}

impl ResponseMsg {
    /// Decode a response from a frame's header and body bytes.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the JSON is malformed or the TxnNo is
    /// missing.
    pub fn from_frame(frame: &Frame) -> Result<Self, NetError> {
        let header: ResHeader = serde_json::from_slice(&frame.header)?;
        header.validate()?;
        let body: Value = serde_json::from_slice(&frame.body)?;
        Ok(Self { header, body })
    }

    /// Deserialize the body into a typed value.
    ///
    /// # Errors
    /// Returns a `Parsing` error if the body does not match `T`.
    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Push a forwarder's Eid onto a path stack.
pub fn push_eid(eids: &mut Vec<String>, eid: impl Into<String>) {
    eids.push(eid.into());
}

/// Pop the most recent hop off a path stack.
pub fn pop_eid(eids: &mut Vec<String>) -> Option<String> {
    eids.pop()
}

/// Peek at the most recent hop of a path stack.
#[must_use]
pub fn peek_eid(eids: &[String]) -> Option<&str> {
    eids.last().map(String::as_str)
}

fn marshal<H: Serialize>(header: &H) -> Result<Vec<u8>, NetError> {
    serde_json::to_vec(header)
        .map_err(|e| NetError::internal(format!("header marshal failed: {e}")))
}

fn marshal_body(body: &Value) -> Result<Vec<u8>, NetError> {
    if body.is_null() {
        return Ok(b"{}".to_vec());
    }
    serde_json::to_vec(body).map_err(|e| NetError::internal(format!("body marshal failed: {e}")))
}

/// Build a `Connect` frame announcing the local entity.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_connect(eid: &str, topology: &Topology) -> Result<Frame, NetError> {
    let header = ConnHeader {
        eid: eid.to_owned(),
        federated: topology.is_federated(),
    };
    Ok(Frame::new(
        MsgType::Connect,
        marshal(&header)?,
        marshal(topology)?,
    ))
}

/// Build an `Accept` frame carrying the handshake verdict.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_accept(verdict: &NetError) -> Result<Frame, NetError> {
    let header = AcceptHeader::from_error(verdict);
    Ok(Frame::new(MsgType::Accept, marshal(&header)?, b"{}".to_vec()))
}

/// Build a `Ping` frame; the one frame with no body section.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_ping(eid: &str) -> Result<Frame, NetError> {
    let header = PingHeader {
        eid: eid.to_owned(),
    };
    Ok(Frame::new(MsgType::Ping, marshal(&header)?, Vec::new()))
}

/// Build a `Die` frame announcing a clean shutdown.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_die(eid: &str) -> Result<Frame, NetError> {
    let header = DieHeader {
        eid: eid.to_owned(),
    };
    Ok(Frame::new(MsgType::Die, marshal(&header)?, b"{}".to_vec()))
}

/// Build a `Request` frame from a routing header and an opaque body.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_request(header: &ReqHeader, body: &Value) -> Result<Frame, NetError> {
    Ok(Frame::new(
        MsgType::Request,
        marshal(header)?,
        marshal_body(body)?,
    ))
}

/// Build a `Response` frame from a correlation header and an opaque body.
///
/// # Errors
/// Returns an `Internal` error if serialization fails.
pub fn build_response(header: &ResHeader, body: &Value) -> Result<Frame, NetError> {
    Ok(Frame::new(
        MsgType::Response,
        marshal(header)?,
        marshal_body(body)?,
    ))
}
