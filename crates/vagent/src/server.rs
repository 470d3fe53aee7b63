//! Server side: one job per inbound request.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use vagent_bridge::{Frame, Tag};

use crate::codec::{Fault, PayloadCodec, Reply, RpcCall};
use crate::manager::{Execution, ServerJob, ServerOutcome};
use crate::methods::{Method, MethodTable};

/// A deferred method execution, polled by the driver.
pub type DeferredReply = BoxFuture<'static, Reply>;

pub struct ServerRequest {
    call: RpcCall,
    method: Option<Method>,
    reply: Option<Reply>,
    codec: Arc<dyn PayloadCodec>,
    max_body: usize,
    audit: bool,
}

impl ServerRequest {
    /// Resolve `call` against `methods`. Unknown methods still produce a job;
    /// it answers with a fault.
    pub fn new(
        call: RpcCall,
        methods: &MethodTable,
        codec: Arc<dyn PayloadCodec>,
        max_body: usize,
        audit: bool,
    ) -> Self {
        let method = methods.lookup(&call.method).cloned();
        Self {
            call,
            method,
            reply: None,
            codec,
            max_body,
            audit,
        }
    }

    pub fn method(&self) -> &str {
        &self.call.method
    }

    fn encode(&self, tag: &Tag, reply: &Reply) -> Bytes {
        let fault = match self.codec.encode_reply(reply) {
            Ok(body) if body.len() <= self.max_body => return body,
            Ok(body) => Fault::internal(format!(
                "reply of {} bytes exceeds limit of {}",
                body.len(),
                self.max_body
            )),
            Err(e) => Fault::internal(e.to_string()),
        };
        tracing::warn!(%tag, method = %self.call.method, %fault, "Replacing unsendable reply");
        self.codec.encode_reply(&Err(fault)).unwrap_or_else(|e| {
            tracing::error!(%tag, error = %e, "Failed to encode fault reply");
            Bytes::new()
        })
    }
}

impl fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", &self.call.method)
            .field("resolved", &self.method.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerJob for ServerRequest {
    type Deferred = DeferredReply;
    type Output = Reply;

    fn execute(&mut self, tag: &Tag) -> Execution<DeferredReply> {
        if self.audit {
            tracing::info!(target: "vagent::audit", %tag, method = %self.call.method, "RPC");
        }
        let params = std::mem::take(&mut self.call.params);
        match &self.method {
            None => {
                tracing::warn!(%tag, method = %self.call.method, "Unknown method");
                self.reply = Some(Err(Fault::unknown_method(&self.call.method)));
                Execution::Immediate
            }
            Some(Method::Immediate(handler)) => {
                self.reply = Some(handler(params));
                Execution::Immediate
            }
            Some(Method::Deferred(method)) => {
                let method = Arc::clone(method);
                Execution::Deferred(Box::pin(async move { method.call(params).await }))
            }
        }
    }

    fn executed(&mut self, output: Reply) {
        self.reply = Some(output);
    }

    fn send(&mut self, tag: &Tag) -> Frame {
        let reply = self
            .reply
            .take()
            .unwrap_or_else(|| Err(Fault::internal("no reply produced")));
        if let Err(fault) = &reply {
            tracing::debug!(%tag, method = %self.call.method, %fault, "Method returned fault");
        }
        let body = self.encode(tag, &reply);
        Frame::response(tag.clone(), self.codec.content_type(), body)
    }

    fn finish(self, tag: &Tag, outcome: ServerOutcome) {
        match outcome {
            ServerOutcome::Sent => {
                tracing::trace!(%tag, method = %self.call.method, "Reply sent");
            }
            ServerOutcome::Cancelled(reason) => {
                tracing::debug!(%tag, method = %self.call.method, %reason, "Request abandoned");
            }
        }
    }
}
