//! The remote endpoint: a single URL accepting JSON POSTs.
//!
//! Requests carry an `action` discriminator, except result submission which
//! posts the bare payload. A reply that is not JSON (an opaque redirect or
//! an HTML page) cannot be confirmed, so it is reported as
//! [`Reply::Assumed`] and callers treat it as success.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint configured")]
    NotConfigured,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("endpoint answered with status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// JSON reply of the endpoint. Different actions answer with either
/// `success: true` or `result: "success"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReplyBody {
    pub fn ok() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            success: Some(false),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true) || self.result.as_deref() == Some("success")
    }

    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "request was not accepted".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Confirmed(ReplyBody),
    /// Delivered, but the endpoint's answer could not be read.
    Assumed,
}

impl Reply {
    pub fn succeeded(&self) -> bool {
        match self {
            Reply::Confirmed(body) => body.is_success(),
            Reply::Assumed => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum AdminRequest {
    #[serde(rename = "admin-login")]
    AdminLogin { password: String },
    #[serde(rename = "requestClearCode", rename_all = "camelCase")]
    RequestClearCode { admin_password: String },
    #[serde(rename = "clearSheet", rename_all = "camelCase")]
    ClearSheet {
        admin_password: String,
        verification_code: String,
    },
}

pub trait Endpoint {
    fn post(&self, body: &Value) -> Result<Reply, TransportError>;

    /// Reachability check made before the experiment starts.
    fn probe(&self) -> Result<(), TransportError>;

    fn is_configured(&self) -> bool {
        true
    }
}

pub fn post_json<T: Serialize>(endpoint: &dyn Endpoint, body: &T) -> Result<Reply, TransportError> {
    let value = serde_json::to_value(body)?;
    endpoint.post(&value)
}

/// Blocking HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Http(err)
    }
}

impl Endpoint for HttpEndpoint {
    fn post(&self, body: &Value) -> Result<Reply, TransportError> {
        debug!(url = %self.url, action = ?body.get("action"), "posting to endpoint");
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "endpoint rejected request");
            return Err(TransportError::Status(status.as_u16()));
        }
        let text = response.text().map_err(classify)?;
        match serde_json::from_str::<ReplyBody>(&text) {
            Ok(body) => Ok(Reply::Confirmed(body)),
            Err(_) => {
                info!("endpoint reply unreadable, assuming delivery");
                Ok(Reply::Assumed)
            }
        }
    }

    fn probe(&self) -> Result<(), TransportError> {
        let response = self.client.head(&self.url).send().map_err(classify)?;
        // Script hosts commonly answer HEAD with 405; reaching them is enough.
        if response.status().is_server_error() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Stand-in used when no endpoint URL is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineEndpoint;

impl Endpoint for OfflineEndpoint {
    fn post(&self, _body: &Value) -> Result<Reply, TransportError> {
        Err(TransportError::NotConfigured)
    }

    fn probe(&self) -> Result<(), TransportError> {
        Err(TransportError::NotConfigured)
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Canned reply for [`ScriptedEndpoint`]
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Reply(ReplyBody),
    Opaque,
    Unreachable,
}

/// Endpoint double for headless runs: records every request that reaches it
/// and answers from a script, falling back to `success: true` once the
/// script is spent. Unreachable attempts are not recorded.
#[derive(Debug, Default)]
pub struct ScriptedEndpoint {
    sent: RefCell<Vec<Value>>,
    script: RefCell<VecDeque<Scripted>>,
    unreachable: Cell<bool>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Scripted) {
        self.script.borrow_mut().push_back(reply);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.set(unreachable);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.borrow().clone()
    }

    /// Requests carrying the given `action`; `None` selects bare payloads.
    pub fn sent_with_action(&self, action: Option<&str>) -> Vec<Value> {
        self.sent
            .borrow()
            .iter()
            .filter(|v| v.get("action").and_then(Value::as_str) == action)
            .cloned()
            .collect()
    }
}

impl Endpoint for ScriptedEndpoint {
    fn post(&self, body: &Value) -> Result<Reply, TransportError> {
        if self.unreachable.get() {
            return Err(TransportError::Unreachable("scripted outage".into()));
        }
        let reply = match self.script.borrow_mut().pop_front() {
            Some(Scripted::Unreachable) => {
                return Err(TransportError::Unreachable("scripted failure".into()))
            }
            Some(Scripted::Reply(reply)) => Reply::Confirmed(reply),
            Some(Scripted::Opaque) => Reply::Assumed,
            None => Reply::Confirmed(ReplyBody::ok()),
        };
        self.sent.borrow_mut().push(body.clone());
        Ok(reply)
    }

    fn probe(&self) -> Result<(), TransportError> {
        if self.unreachable.get() {
            Err(TransportError::Unreachable("scripted outage".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn admin_requests_carry_action_discriminator() {
        let login = serde_json::to_value(AdminRequest::AdminLogin {
            password: "pw".into(),
        })
        .unwrap();
        assert_eq!(login, json!({"action": "admin-login", "password": "pw"}));

        let code = serde_json::to_value(AdminRequest::RequestClearCode {
            admin_password: "pw".into(),
        })
        .unwrap();
        assert_eq!(
            code,
            json!({"action": "requestClearCode", "adminPassword": "pw"})
        );

        let clear = serde_json::to_value(AdminRequest::ClearSheet {
            admin_password: "pw".into(),
            verification_code: "123456".into(),
        })
        .unwrap();
        assert_eq!(
            clear,
            json!({"action": "clearSheet", "adminPassword": "pw", "verificationCode": "123456"})
        );
    }

    #[test]
    fn both_success_shapes_are_accepted() {
        let a: ReplyBody = serde_json::from_str(r#"{"success":true}"#).unwrap();
        let b: ReplyBody = serde_json::from_str(r#"{"result":"success"}"#).unwrap();
        let c: ReplyBody = serde_json::from_str(r#"{"result":"error","error":"bad code"}"#).unwrap();
        assert!(a.is_success());
        assert!(b.is_success());
        assert!(!c.is_success());
        assert_eq!(c.reason(), "bad code");
        assert!(Reply::Assumed.succeeded());
    }

    #[test]
    fn offline_endpoint_is_not_configured() {
        let e = OfflineEndpoint;
        assert!(!e.is_configured());
        assert_matches!(e.post(&json!({})), Err(TransportError::NotConfigured));
        assert_matches!(e.probe(), Err(TransportError::NotConfigured));
    }

    #[test]
    fn scripted_endpoint_records_and_replays() {
        let e = ScriptedEndpoint::new();
        e.push(Scripted::Reply(ReplyBody::failed("nope")));
        e.push(Scripted::Opaque);

        let first = post_json(&e, &AdminRequest::AdminLogin { password: "x".into() }).unwrap();
        assert!(!first.succeeded());
        assert_eq!(e.post(&json!({"n": 1})).unwrap(), Reply::Assumed);
        assert!(e.post(&json!({"n": 2})).unwrap().succeeded());

        assert_eq!(e.sent().len(), 3);
        assert_eq!(e.sent_with_action(Some("admin-login")).len(), 1);
        assert_eq!(e.sent_with_action(None).len(), 2);

        e.set_unreachable(true);
        assert_matches!(e.post(&json!({})), Err(TransportError::Unreachable(_)));
        assert_eq!(e.sent().len(), 3);

        e.set_unreachable(false);
        e.push(Scripted::Unreachable);
        assert_matches!(e.post(&json!({"n": 3})), Err(TransportError::Unreachable(_)));
        assert_eq!(e.sent().len(), 3);
        assert!(e.post(&json!({"n": 4})).unwrap().succeeded());
        assert_eq!(e.sent().len(), 4);
    }

    #[test]
    fn http_endpoint_builds() {
        let e = HttpEndpoint::new("http://127.0.0.1:9/exec").unwrap();
        assert_eq!(e.url(), "http://127.0.0.1:9/exec");
        assert!(e.is_configured());
    }
}
