//! Out-of-band control protocol.
//!
//! The subprocess may interrupt its output stream with `control_request`
//! frames (tool permission checks, hook callbacks, MCP relays) that must be
//! answered with a `control_response` carrying the same `request_id`. The
//! other direction is used for requests this side initiates, such as
//! `interrupt`.
//!
//! [`ControlRouter`] is owned by the session actor. Inbound requests become
//! detached futures that run the caller's [`ControlHandler`] under a
//! timeout, so a slow callback never stalls stream processing; the actor
//! writes the finished response itself.

use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// A parsed inbound control request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Permission check before the subprocess runs a tool.
    CanUseTool {
        /// Tool the subprocess wants to run.
        tool_name: String,
        /// Proposed tool input.
        input: Value,
        /// Permission update suggestions, passed through untouched.
        suggestions: Option<Value>,
    },
    /// Callback for a hook registered at initialization.
    HookCallback {
        /// Identifier of the registered callback.
        callback_id: String,
        /// Hook input payload.
        input: Value,
        /// Tool use this hook fired for, if any.
        tool_use_id: Option<String>,
    },
    /// JSON-RPC message relayed to an in-process MCP server.
    McpMessage {
        /// Target server name.
        server_name: String,
        /// Raw JSON-RPC message.
        message: Value,
    },
    /// Any subtype this crate does not model.
    Other {
        /// The `subtype` field, or empty when absent.
        subtype: String,
        /// Entire request body.
        body: Value,
    },
}

#[derive(Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum WireRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, alias = "permission_suggestions")]
        suggestions: Option<Value>,
    },
    HookCallback {
        callback_id: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    McpMessage {
        server_name: String,
        message: Value,
    },
}

impl ControlRequest {
    /// Parse the `request` object of a `control_request` frame.
    ///
    /// Unknown subtypes and known subtypes with missing fields both come
    /// back as [`ControlRequest::Other`].
    #[must_use]
    pub fn parse(request: &Value) -> Self {
        match WireRequest::deserialize(request) {
            Ok(WireRequest::CanUseTool {
                tool_name,
                input,
                suggestions,
            }) => Self::CanUseTool {
                tool_name,
                input,
                suggestions,
            },
            Ok(WireRequest::HookCallback {
                callback_id,
                input,
                tool_use_id,
            }) => Self::HookCallback {
                callback_id,
                input,
                tool_use_id,
            },
            Ok(WireRequest::McpMessage {
                server_name,
                message,
            }) => Self::McpMessage {
                server_name,
                message,
            },
            Err(_) => Self::Other {
                subtype: request
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                body: request.clone(),
            },
        }
    }

    /// Wire `subtype` of this request.
    #[must_use]
    pub fn subtype(&self) -> &str {
        match self {
            Self::CanUseTool { .. } => "can_use_tool",
            Self::HookCallback { .. } => "hook_callback",
            Self::McpMessage { .. } => "mcp_message",
            Self::Other { subtype, .. } => subtype,
        }
    }
}

/// Caller-supplied callback answering inbound control requests.
///
/// The returned value becomes the `response` payload. For `can_use_tool`
/// it should be a permission result, see [`PermissionDecision`].
pub trait ControlHandler: Send + Sync {
    /// Answer one control request.
    ///
    /// # Errors
    ///
    /// Any error is turned into a deny (for permission checks) or an error
    /// response; it never ends the session.
    fn handle(
        &self,
        request: ControlRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;
}

impl<F, Fut> ControlHandler for F
where
    F: Fn(ControlRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn handle(
        &self,
        request: ControlRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
        Box::pin(self(request))
    }
}

/// Outcome of a tool permission check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Let the tool run, optionally with rewritten input.
    Allow {
        /// Replacement input; the original input is used when `None`.
        updated_input: Option<Value>,
    },
    /// Refuse the tool.
    Deny {
        /// Explanation shown to the model.
        message: String,
        /// Also stop the current turn.
        interrupt: bool,
    },
}

impl PermissionDecision {
    /// Allow with the original input.
    #[must_use]
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    /// Deny without interrupting the turn.
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Wire form: `{"behavior":"allow",...}` or `{"behavior":"deny",...}`.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Allow { updated_input } => {
                let mut value = json!({ "behavior": "allow" });
                if let Some(input) = updated_input {
                    value["updatedInput"] = input;
                }
                value
            }
            Self::Deny { message, interrupt } => {
                let mut value = json!({ "behavior": "deny", "message": message });
                if interrupt {
                    value["interrupt"] = Value::Bool(true);
                }
                value
            }
        }
    }
}

/// Deferred answer to an inbound request, ready to be written.
pub type DeferredResponse = Pin<Box<dyn Future<Output = Value> + Send + 'static>>;

/// Routes control traffic for one session.
pub struct ControlRouter {
    handler: Option<Arc<dyn ControlHandler>>,
    timeout: Duration,
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    next_id: u64,
}

impl ControlRouter {
    /// Create a router answering with `handler`, each call bounded by `timeout`.
    #[must_use]
    pub fn new(handler: Option<Arc<dyn ControlHandler>>, timeout: Duration) -> Self {
        Self {
            handler,
            timeout,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Number of outbound requests still waiting for a response.
    #[must_use]
    pub fn pending_outbound(&self) -> usize {
        self.pending.len()
    }

    /// Build the deferred response for an inbound `control_request`.
    ///
    /// The future owns everything it needs and can be spawned. It always
    /// yields a complete `control_response` envelope. A callback error or
    /// panic, a timeout, or a missing handler produces a deny result for
    /// `can_use_tool` and an error response for every other subtype.
    #[must_use]
    pub fn handle_inbound_request(&self, request_id: String, request: &Value) -> DeferredResponse {
        let parsed = ControlRequest::parse(request);
        let handler = self.handler.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let subtype = parsed.subtype().to_owned();
            let is_permission = matches!(parsed, ControlRequest::CanUseTool { .. });
            debug!(request_id, subtype, "control: inbound request");

            let outcome = match handler {
                None => Err(AppError::Control(format!(
                    "no handler configured for '{subtype}'"
                ))),
                Some(handler) => {
                    let call =
                        AssertUnwindSafe(async { handler.handle(parsed).await }).catch_unwind();
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(payload)) => Err(AppError::Control(format!(
                            "'{subtype}' callback panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                        Err(_) => Err(AppError::ControlTimeout(format!(
                            "'{subtype}' callback did not answer within {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
            };

            match outcome {
                Ok(body) => success_response(&request_id, body),
                Err(err) => {
                    warn!(request_id, subtype, error = %err, "control: request failed");
                    if is_permission {
                        success_response(
                            &request_id,
                            PermissionDecision::deny(err.to_string()).into_value(),
                        )
                    } else {
                        error_response(&request_id, &err.to_string())
                    }
                }
            }
        })
    }

    /// Allocate an id for an outbound request and remember its waiter.
    ///
    /// Returns the request id, the full `control_request` envelope to write,
    /// and the receiver completed by [`ControlRouter::resolve`].
    pub fn register_outbound(
        &mut self,
        request: Value,
    ) -> (String, Value, oneshot::Receiver<Result<Value>>) {
        self.next_id += 1;
        let suffix = Uuid::new_v4().simple().to_string();
        let request_id = format!("req_{}_{}", self.next_id, &suffix[..8]);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let envelope = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        (request_id, envelope, rx)
    }

    /// Complete the outbound request `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if no request with that id is pending.
    pub fn resolve(&mut self, request_id: &str, outcome: Result<Value>) -> Result<()> {
        let Some(tx) = self.pending.remove(request_id) else {
            return Err(AppError::NotFound(format!(
                "no pending control request for request_id '{request_id}'"
            )));
        };
        if tx.send(outcome).is_err() {
            debug!(request_id, "control: waiter gone before response arrived");
        }
        Ok(())
    }

    /// Fail every pending outbound request with `err`.
    pub fn cancel_all(&mut self, err: &AppError) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

impl std::fmt::Debug for ControlRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRouter")
            .field("has_handler", &self.handler.is_some())
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// `control_response` envelope for a successful answer.
#[must_use]
pub fn success_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

/// `control_response` envelope for a failed answer.
#[must_use]
pub fn error_response(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        }
    })
}
