use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action names understood by the service.
///
/// Requests are acknowledged with the same action plus an `/ok` or `/error`
/// suffix; subscription traffic arrives under the `rtm/subscription/*`
/// actions without a request id.
pub mod actions {
    pub const PUBLISH: &str = "rtm/publish";
    pub const SUBSCRIBE: &str = "rtm/subscribe";
    pub const UNSUBSCRIBE: &str = "rtm/unsubscribe";
    pub const READ: &str = "rtm/read";
    pub const WRITE: &str = "rtm/write";
    pub const DELETE: &str = "rtm/delete";
    pub const SEARCH: &str = "rtm/search";

    pub const AUTH_HANDSHAKE: &str = "auth/handshake";
    pub const AUTH_AUTHENTICATE: &str = "auth/authenticate";

    pub const SUBSCRIPTION_DATA: &str = "rtm/subscription/data";
    pub const SUBSCRIPTION_ERROR: &str = "rtm/subscription/error";
    pub const SUBSCRIPTION_INFO: &str = "rtm/subscription/info";

    /// Unsolicited general error, not tied to any request.
    pub const GENERAL_ERROR: &str = "/error";

    /// The positive reply action for a request action.
    pub fn ok(action: &str) -> String {
        format!("{action}/ok")
    }

    /// The negative reply action for a request action.
    pub fn error(action: &str) -> String {
        format!("{action}/error")
    }
}

/// The base message envelope exchanged on the wire.
///
/// `id` is present iff the sender wants the request acknowledged; `body` may
/// be omitted by the server for `rtm/publish/ok` and `rtm/delete/ok`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pdu {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Pdu {
    /// A request PDU without an id (no acknowledgement requested).
    pub fn request(action: impl Into<String>, body: Value) -> Self {
        Self { action: action.into(), id: None, body: Some(body) }
    }

    /// A request PDU carrying an id.
    pub fn with_id(action: impl Into<String>, id: u64, body: Value) -> Self {
        Self { action: action.into(), id: Some(id), body: Some(body) }
    }

    pub fn is_ok_reply(&self) -> bool {
        self.action.ends_with("/ok")
    }

    pub fn is_error_reply(&self) -> bool {
        self.action.ends_with("/error")
    }

    /// Streaming replies (e.g. `rtm/search/data`) keep their continuation
    /// registered; everything else is a one-shot acknowledgement.
    pub fn is_data(&self) -> bool {
        self.action.ends_with("/data")
    }

    /// Whether the server is allowed to omit `body` for this action.
    pub fn may_omit_body(&self) -> bool {
        self.action == "rtm/publish/ok" || self.action == "rtm/delete/ok"
    }

    /// The `body.position` field, when present and textual.
    pub fn position(&self) -> Option<&str> {
        self.body.as_ref()?.get("position")?.as_str()
    }

    /// Parse the body as an error description, for `*/error` replies.
    pub fn error_body(&self) -> Option<ErrorBody> {
        serde_json::from_value(self.body.clone()?).ok()
    }
}

/// Body of an `rtm/subscription/data` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Body of a negative reply or an `rtm/subscription/error` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl ErrorBody {
    /// Human-readable form used when latching failure reasons.
    pub fn describe(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{}: {}", self.error, reason),
            None => self.error.clone(),
        }
    }
}

/// Body of an `rtm/subscribe/ok` reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOkBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of an `rtm/publish/ok` reply, when the server includes one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishOkBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of an `rtm/read/ok` reply; `message` is null when the key is unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadOkBody {
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of an `rtm/write/ok` reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteOkBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of an `rtm/search/data` or `rtm/search/ok` reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchDataBody {
    #[serde(default)]
    pub channels: Vec<String>,
}
