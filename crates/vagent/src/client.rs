//! Client side: outbound calls and the async handle used to issue them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use vagent_bridge::{Frame, Tag};

use crate::codec::{CodecError, Fault, PayloadCodec};
use crate::manager::{CancelReason, ClientJob, ClientOutcome, JobError};

/// Raw response body, or why there is none.
pub type CallResult = Result<Bytes, CallError>;

/// Invoked exactly once per call.
pub type Callback = Box<dyn FnOnce(CallResult) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call timed out")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("failed to send request")]
    SendFailed,

    #[error("call rejected: {0}")]
    Rejected(#[from] JobError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("request body of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: usize },

    #[error("remote {0}")]
    Fault(#[from] Fault),

    #[error("unexpected reply: {0}")]
    BadReply(String),
}

impl From<CancelReason> for CallError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Timeout => CallError::Timeout,
            CancelReason::ChannelClosed => CallError::ChannelClosed,
            CancelReason::SendFailed => CallError::SendFailed,
        }
    }
}

/// One outbound request.
pub struct ClientCall {
    method: String,
    content_type: &'static str,
    body: Bytes,
    callback: Callback,
}

impl ClientCall {
    pub fn new(
        method: impl Into<String>,
        content_type: &'static str,
        body: Bytes,
        callback: Callback,
    ) -> Self {
        Self {
            method: method.into(),
            content_type,
            body,
            callback,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Report a call that never made it into the queue.
    pub(crate) fn reject(self, err: CallError) {
        (self.callback)(Err(err));
    }
}

impl fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCall")
            .field("method", &self.method)
            .field("len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl ClientJob for ClientCall {
    fn send(&mut self, tag: &Tag) -> Frame {
        Frame::request(tag.clone(), self.content_type, self.body.clone())
    }

    fn finish(self, tag: &Tag, outcome: ClientOutcome) {
        let result = match outcome {
            ClientOutcome::Response(frame) => {
                tracing::debug!(%tag, method = %self.method, len = frame.body.len(), "Call answered");
                Ok(frame.body)
            }
            ClientOutcome::Cancelled(reason) => {
                tracing::debug!(%tag, method = %self.method, %reason, "Call cancelled");
                Err(CallError::from(reason))
            }
        };
        (self.callback)(result);
    }
}

/// Requests from handles to the channel task.
#[derive(Debug)]
pub enum Command {
    Call {
        method: String,
        params: Value,
        timeout: Option<Duration>,
        reply: oneshot::Sender<CallResult>,
    },
}

/// Cloneable handle for issuing calls to the peer from any task.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    codec: Arc<dyn PayloadCodec>,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle").finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub fn new(tx: mpsc::Sender<Command>, codec: Arc<dyn PayloadCodec>) -> Self {
        Self { tx, codec }
    }

    /// Create a handle plus the receiver the driver reads commands from.
    pub fn channel(capacity: usize, codec: Arc<dyn PayloadCodec>) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, codec), rx)
    }

    /// Issue a call and return the raw response body.
    pub async fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> CallResult {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Call {
            method: method.to_string(),
            params,
            timeout,
            reply,
        };
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CallError::ChannelClosed)?;
        rx.await.map_err(|_| CallError::ChannelClosed)?
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, None).await
    }

    /// Like [`call`](Self::call) but overrides the channel's default timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let body = self.call_raw(method, params, timeout).await?;
        let reply = self.codec.decode_reply(&body)?;
        Ok(reply?)
    }
}
