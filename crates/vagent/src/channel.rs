//! Transport scheduler for one host/guest channel.
//!
//! `Channel` owns the frame decoder, the job manager and the outgoing frame
//! currently being written. It performs no I/O: the driver feeds it bytes and
//! events, writes whatever `poll_transmit` returns and carries out the
//! timer and execution requests from `poll_output`. Everything runs on the
//! caller's task, and no call here ever blocks.
//!
//! ```text
//!   bytes in ──► handle_input ──► FrameReady ─┬─► request  ─► server_job_add
//!                                              └─► response ─► read_done
//!   poll_transmit ◄── OutgoingFrame ◄── take_outbound ◄── kick()
//!   transmitted(n) ──► SendComplete ──► send_done
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::Decoder;
use vagent_bridge::{
    Decoded, Frame, FrameCodec, FrameKind, FrameLimits, OutgoingFrame, SendState, Tag, TagGenerator,
};

use crate::client::{CallError, Callback, ClientCall};
use crate::codec::{PayloadCodec, Reply, RpcCall};
use crate::config::{DEFAULT_CALL_TIMEOUT, Role};
use crate::manager::{
    CancelReason, Completion, JobError, JobKey, JobManager, ManagerLimits, QueueKind,
};
use crate::methods::MethodTable;
use crate::server::{DeferredReply, ServerRequest};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub role: Role,
    pub frame_limits: FrameLimits,
    pub manager_limits: ManagerLimits,
    /// Used when a call does not set its own timeout.
    pub call_timeout: Duration,
    /// Log every executed RPC under the `vagent::audit` target.
    pub audit: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            role: Role::Guest,
            frame_limits: FrameLimits::default(),
            manager_limits: ManagerLimits::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            audit: false,
        }
    }
}

/// Inputs to the scheduler.
#[derive(Debug)]
pub enum Event {
    FrameReady(Frame),
    /// The current outgoing frame has been fully written.
    SendComplete,
    /// Writing the current outgoing frame failed.
    SendFailed,
    TimerFired(Tag),
    /// A job was queued outside of `step`; run the scheduling pass.
    JobAdded,
    ExecuteFinished { tag: Tag, reply: Reply },
    Disconnected,
}

/// Work the driver must carry out on the channel's behalf.
pub enum Output {
    ArmTimer { tag: Tag, after: Duration },
    DisarmTimer { tag: Tag },
    /// Poll `work` and report its result with `Event::ExecuteFinished`.
    Execute { tag: Tag, work: DeferredReply },
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::ArmTimer { tag, after } => f
                .debug_struct("ArmTimer")
                .field("tag", tag)
                .field("after", after)
                .finish(),
            Output::DisarmTimer { tag } => f.debug_struct("DisarmTimer").field("tag", tag).finish(),
            Output::Execute { tag, .. } => f
                .debug_struct("Execute")
                .field("tag", tag)
                .finish_non_exhaustive(),
        }
    }
}

pub struct Channel {
    config: ChannelConfig,
    codec: Arc<dyn PayloadCodec>,
    methods: Arc<MethodTable>,
    framer: FrameCodec,
    manager: JobManager<ServerRequest, ClientCall>,
    tags: TagGenerator,
    sending: Option<(JobKey, OutgoingFrame)>,
    outputs: VecDeque<Output>,
}

impl Channel {
    pub fn new(config: ChannelConfig, methods: MethodTable, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            framer: FrameCodec::with_limits(config.frame_limits),
            manager: JobManager::new(config.manager_limits),
            tags: TagGenerator::new(),
            methods: Arc::new(methods),
            sending: None,
            outputs: VecDeque::new(),
            codec,
            config,
        }
    }

    pub fn with_tags(mut self, tags: TagGenerator) -> Self {
        self.tags = tags;
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn manager(&self) -> &JobManager<ServerRequest, ClientCall> {
        &self.manager
    }

    pub fn is_sending(&self) -> bool {
        self.sending.is_some()
    }

    pub fn step(&mut self, event: Event) {
        match event {
            Event::FrameReady(frame) => match frame.kind {
                FrameKind::Request => self.on_request(frame),
                FrameKind::Response => self.on_response(frame),
            },
            Event::SendComplete => {
                if let Some((key, _)) = self.sending.take() {
                    tracing::trace!(tag = %key.tag, queue = %key.queue, "Frame written");
                    if let Err(e) = self.manager.send_done(key.queue, &key.tag) {
                        tracing::warn!(error = %e, "Unexpected send completion");
                    }
                }
            }
            Event::SendFailed => self.abandon_send(CancelReason::SendFailed),
            Event::TimerFired(tag) => {
                match self
                    .manager
                    .cancel(QueueKind::Client, &tag, CancelReason::Timeout)
                {
                    Ok(()) => tracing::debug!(%tag, "Call timed out"),
                    Err(e) => tracing::trace!(%tag, error = %e, "Timer fired for finished call"),
                }
            }
            Event::JobAdded => self.manager.kick(),
            Event::ExecuteFinished { tag, reply } => {
                if let Err(e) = self.manager.execute_done(&tag, reply) {
                    tracing::debug!(%tag, error = %e, "Dropping execution result");
                }
            }
            Event::Disconnected => {
                self.framer.reset();
                self.abandon_send(CancelReason::ChannelClosed);
                let cancelled = self.manager.cancel_all(CancelReason::ChannelClosed);
                if cancelled > 0 {
                    tracing::warn!(cancelled, "Channel disconnected, outstanding jobs cancelled");
                }
            }
        }
        self.collect();
    }

    /// Decode every complete frame in `buf` and act on it.
    pub fn handle_input(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        while let Some(item) = self.framer.decode(buf)? {
            self.on_decoded(item);
        }
        Ok(())
    }

    /// The stream hit end-of-file. Any partial frame is discarded.
    pub fn handle_eof(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        while let Some(item) = self.framer.decode_eof(buf)? {
            self.on_decoded(item);
        }
        Ok(())
    }

    fn on_decoded(&mut self, item: Decoded) {
        match item {
            Decoded::Frame(frame) => self.step(Event::FrameReady(frame)),
            Decoded::Discarded(err) => tracing::debug!(error = %err, "Frame discarded"),
        }
    }

    fn on_request(&mut self, frame: Frame) {
        if frame.content_type != self.codec.content_type() {
            tracing::debug!(tag = %frame.tag, content_type = %frame.content_type, "Unexpected content type");
        }
        let call = match self.codec.decode_call(&frame.body) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(tag = %frame.tag, error = %e, "Dropping unparseable request");
                return;
            }
        };
        tracing::debug!(tag = %frame.tag, method = %call.method, "Request received");
        let job = ServerRequest::new(
            call,
            &self.methods,
            Arc::clone(&self.codec),
            self.config.frame_limits.max_content_len,
            self.config.audit,
        );
        if let Err(rejected) = self.manager.server_job_add(frame.tag, job) {
            tracing::warn!(
                method = %rejected.job.method(),
                error = %rejected.error,
                "Dropping request"
            );
        }
    }

    fn on_response(&mut self, frame: Frame) {
        let tag = frame.tag.clone();
        match self.manager.read_done(&tag, frame) {
            Ok(()) => {}
            Err(JobError::UnknownJob { .. }) => {
                tracing::debug!(%tag, "Dropping unmatched response");
            }
            Err(e) => tracing::warn!(%tag, error = %e, "Dropping response"),
        }
    }

    /// Give up on the frame being written and release its slot.
    fn abandon_send(&mut self, reason: CancelReason) {
        let Some((key, out)) = self.sending.take() else {
            return;
        };
        tracing::warn!(
            tag = %key.tag,
            queue = %key.queue,
            unsent = out.remaining(),
            %reason,
            "Abandoning frame"
        );
        // Cancelling leaves the slot orphaned; completing the send frees it.
        let _ = self.manager.cancel(key.queue, &key.tag, reason);
        let _ = self.manager.send_done(key.queue, &key.tag);
    }

    fn collect(&mut self) {
        for (tag, work) in self.manager.take_deferred() {
            self.outputs.push_back(Output::Execute { tag, work });
        }
        for done in self.manager.drain_completed() {
            let timer_live = done.how != Completion::Cancelled(CancelReason::Timeout);
            if done.key.queue == QueueKind::Client && timer_live {
                self.outputs
                    .push_back(Output::DisarmTimer { tag: done.key.tag });
            }
        }
    }

    /// Issue a call to the peer.
    ///
    /// `callback` runs exactly once: with the raw response body, with a
    /// cancellation, or right away if the call is rejected. A rejection is
    /// also returned as `Err`.
    pub fn invoke(
        &mut self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        callback: Callback,
    ) -> Result<Tag, CallError> {
        let body = match self.codec.encode_call(&RpcCall::new(method, params)) {
            Ok(body) => body,
            Err(e) => return Err(reject(callback, CallError::Codec(e))),
        };
        let limit = self.config.frame_limits.max_content_len;
        if body.len() > limit {
            let len = body.len();
            return Err(reject(callback, CallError::TooLarge { len, limit }));
        }

        let tag = self.tags.next_tag();
        let job = ClientCall::new(method, self.codec.content_type(), body, callback);
        if let Err(rejected) = self.manager.client_job_add(tag.clone(), job) {
            let err = CallError::Rejected(rejected.error);
            tracing::warn!(method, error = %err, "Call rejected");
            rejected.job.reject(err.clone());
            return Err(err);
        }
        tracing::debug!(%tag, method, "Call queued");

        let after = timeout.unwrap_or(self.config.call_timeout);
        self.outputs.push_back(Output::ArmTimer {
            tag: tag.clone(),
            after,
        });
        self.step(Event::JobAdded);
        Ok(tag)
    }

    /// Bytes to write next, if any.
    ///
    /// Returns the unwritten rest of the current section (header or body).
    /// Report progress with [`transmitted`](Self::transmitted).
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        if self.sending.is_none()
            && let Some(out) = self.manager.take_outbound()
        {
            tracing::debug!(
                tag = %out.key.tag,
                queue = %out.key.queue,
                kind = %out.frame.kind,
                len = out.frame.body.len(),
                "Sending frame"
            );
            let frame = OutgoingFrame::new(&out.frame);
            self.sending = Some((out.key, frame));
        }
        self.sending
            .as_ref()
            .map(|(_, out)| out.chunk())
            .filter(|chunk| !chunk.is_empty())
    }

    /// `n` bytes from the last `poll_transmit` chunk were written.
    pub fn transmitted(&mut self, n: usize) {
        let Some((_, out)) = self.sending.as_mut() else {
            return;
        };
        if out.advance(n) == SendState::Complete {
            self.step(Event::SendComplete);
        }
    }

    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }
}

fn reject(callback: Callback, err: CallError) -> CallError {
    tracing::warn!(error = %err, "Call rejected");
    callback(Err(err.clone()));
    err
}
