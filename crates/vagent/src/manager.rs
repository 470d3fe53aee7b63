//! Job manager: server and client job queues sharing one send budget.
//!
//! Each channel owns one `JobManager`. Server jobs are inbound requests we
//! execute and answer; client jobs are outbound requests waiting for the
//! peer's answer. Both kinds compete for a small number of send slots (one
//! by default), so only that many frames are ever being written at once.
//!
//! State sequences:
//!
//! ```text
//! server: New -> Busy(Executing) -> Executed -> Busy(Sending) -> Sent -> Done
//! client: New -> Busy -> Sent -> Read -> Done
//! ```
//!
//! Server jobs always get first claim on a free slot. If both peers have a
//! request outstanding and each answers before asking, neither side can end
//! up waiting on a response the other is starved from sending.
//!
//! The manager does no I/O. Frames to write are queued as [`Outbound`] and
//! deferred executions are handed out through [`JobManager::take_deferred`];
//! the owning channel performs both and reports back through
//! [`JobManager::send_done`] and [`JobManager::execute_done`].

use std::collections::{HashSet, VecDeque};
use std::fmt;

use indexmap::IndexMap;
use vagent_bridge::{Frame, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Server,
    Client,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Server => write!(f, "server"),
            QueueKind::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStage {
    Executing,
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerJobState {
    New,
    Busy(ServerStage),
    Executed,
    Sent,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientJobState {
    New,
    /// Request frame claimed a send slot and is being written.
    Busy,
    Sent,
    Read,
    Done,
}

/// Why a job was forced to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    ChannelClosed,
    SendFailed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "timeout"),
            CancelReason::ChannelClosed => write!(f, "channel closed"),
            CancelReason::SendFailed => write!(f, "send failed"),
        }
    }
}

/// How `ServerJob::execute` completed.
pub enum Execution<D> {
    /// Output is already stored in the job.
    Immediate,
    /// Output arrives later through `execute_done`.
    Deferred(D),
}

pub enum ServerOutcome {
    Sent,
    Cancelled(CancelReason),
}

pub enum ClientOutcome {
    Response(Frame),
    Cancelled(CancelReason),
}

/// An inbound request being serviced.
pub trait ServerJob {
    /// Work that completes outside the manager, e.g. a future.
    type Deferred;
    /// Result delivered through `execute_done`.
    type Output;

    fn execute(&mut self, tag: &Tag) -> Execution<Self::Deferred>;

    fn executed(&mut self, output: Self::Output);

    /// Build the response frame. Called once, when a send slot is claimed.
    fn send(&mut self, tag: &Tag) -> Frame;

    fn finish(self, tag: &Tag, outcome: ServerOutcome);
}

/// An outbound request awaiting a response.
pub trait ClientJob {
    /// Build the request frame. Called once, when a send slot is claimed.
    fn send(&mut self, tag: &Tag) -> Frame;

    /// Runs exactly once per job.
    fn finish(self, tag: &Tag, outcome: ClientOutcome);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{queue} queue is full ({limit} jobs)")]
    QueueFull { queue: QueueKind, limit: usize },

    #[error("{queue} job {tag} is already outstanding")]
    DuplicateTag { queue: QueueKind, tag: Tag },

    #[error("no {queue} job {tag}")]
    UnknownJob { queue: QueueKind, tag: Tag },

    #[error("{queue} job {tag}: {event} not allowed in state {state}")]
    IllegalTransition {
        queue: QueueKind,
        tag: Tag,
        state: String,
        event: &'static str,
    },
}

/// A refused job, handed back so the caller can still report to its owner.
#[derive(Debug)]
pub struct Rejected<J> {
    pub error: JobError,
    pub job: J,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerLimits {
    /// Frames that may be written concurrently across both queues.
    pub send_budget: usize,
    pub max_server_jobs: usize,
    pub max_client_jobs: usize,
}

impl ManagerLimits {
    pub const DEFAULT_SEND_BUDGET: usize = 1;
    pub const DEFAULT_MAX_JOBS: usize = 16;
}

impl Default for ManagerLimits {
    fn default() -> Self {
        Self {
            send_budget: Self::DEFAULT_SEND_BUDGET,
            max_server_jobs: Self::DEFAULT_MAX_JOBS,
            max_client_jobs: Self::DEFAULT_MAX_JOBS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub queue: QueueKind,
    pub tag: Tag,
}

/// A frame authorized for writing. Report completion with `send_done`.
#[derive(Debug)]
pub struct Outbound {
    pub key: JobKey,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Sent,
    Read,
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub key: JobKey,
    pub how: Completion,
}

struct ServerEntry<S> {
    job: S,
    state: ServerJobState,
}

struct ClientEntry<C> {
    job: C,
    state: ClientJobState,
    response: Option<Frame>,
}

pub struct JobManager<S: ServerJob, C: ClientJob> {
    limits: ManagerLimits,
    server: IndexMap<Tag, ServerEntry<S>>,
    client: IndexMap<Tag, ClientEntry<C>>,
    sends_in_flight: usize,
    /// Slots still held by jobs cancelled while their frame was on the wire.
    orphaned: HashSet<JobKey>,
    outbox: VecDeque<Outbound>,
    deferred: Vec<(Tag, S::Deferred)>,
    completed: Vec<Completed>,
}

impl<S: ServerJob, C: ClientJob> JobManager<S, C> {
    /// A `send_budget` of 0 could never send anything; it is raised to 1.
    pub fn new(limits: ManagerLimits) -> Self {
        if limits.send_budget == 0 {
            tracing::warn!("Send budget of 0 would stall the channel, using 1");
        }
        Self {
            limits: ManagerLimits {
                send_budget: limits.send_budget.max(1),
                ..limits
            },
            server: IndexMap::new(),
            client: IndexMap::new(),
            sends_in_flight: 0,
            orphaned: HashSet::new(),
            outbox: VecDeque::new(),
            deferred: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn limits(&self) -> ManagerLimits {
        self.limits
    }

    pub fn server_job_add(&mut self, tag: Tag, job: S) -> Result<(), Rejected<S>> {
        let queue = QueueKind::Server;
        if let Err(error) = self.admit(queue, &tag) {
            return Err(Rejected { error, job });
        }
        tracing::trace!(%tag, %queue, "Job added");
        self.server.insert(
            tag,
            ServerEntry {
                job,
                state: ServerJobState::New,
            },
        );
        self.kick();
        Ok(())
    }

    pub fn client_job_add(&mut self, tag: Tag, job: C) -> Result<(), Rejected<C>> {
        let queue = QueueKind::Client;
        if let Err(error) = self.admit(queue, &tag) {
            return Err(Rejected { error, job });
        }
        tracing::trace!(%tag, %queue, "Job added");
        self.client.insert(
            tag,
            ClientEntry {
                job,
                state: ClientJobState::New,
                response: None,
            },
        );
        self.kick();
        Ok(())
    }

    fn admit(&self, queue: QueueKind, tag: &Tag) -> Result<(), JobError> {
        let (len, limit, present) = match queue {
            QueueKind::Server => (
                self.server.len(),
                self.limits.max_server_jobs,
                self.server.contains_key(tag),
            ),
            QueueKind::Client => (
                self.client.len(),
                self.limits.max_client_jobs,
                self.client.contains_key(tag),
            ),
        };
        let key = JobKey {
            queue,
            tag: tag.clone(),
        };
        if present || self.orphaned.contains(&key) {
            return Err(JobError::DuplicateTag {
                queue,
                tag: tag.clone(),
            });
        }
        if len >= limit {
            return Err(JobError::QueueFull { queue, limit });
        }
        Ok(())
    }

    /// A deferred execution finished.
    pub fn execute_done(&mut self, tag: &Tag, output: S::Output) -> Result<(), JobError> {
        let queue = QueueKind::Server;
        let entry = self.server.get_mut(tag).ok_or_else(|| JobError::UnknownJob {
            queue,
            tag: tag.clone(),
        })?;
        if entry.state != ServerJobState::Busy(ServerStage::Executing) {
            return Err(illegal(queue, tag, entry.state, "execute_done"));
        }
        entry.job.executed(output);
        transition_server(tag, entry, ServerJobState::Executed);
        self.kick();
        Ok(())
    }

    /// The frame claimed by `(queue, tag)` has been fully written.
    pub fn send_done(&mut self, queue: QueueKind, tag: &Tag) -> Result<(), JobError> {
        let key = JobKey {
            queue,
            tag: tag.clone(),
        };
        if self.orphaned.remove(&key) {
            tracing::trace!(%tag, %queue, "Orphaned send completed");
            self.release_slot();
            self.kick();
            return Ok(());
        }

        match queue {
            QueueKind::Server => {
                let entry = self
                    .server
                    .get_mut(tag)
                    .ok_or(JobError::UnknownJob { queue, tag: key.tag })?;
                if entry.state != ServerJobState::Busy(ServerStage::Sending) {
                    return Err(illegal(queue, tag, entry.state, "send_done"));
                }
                transition_server(tag, entry, ServerJobState::Sent);
            }
            QueueKind::Client => {
                let entry = self
                    .client
                    .get_mut(tag)
                    .ok_or(JobError::UnknownJob { queue, tag: key.tag })?;
                if entry.state != ClientJobState::Busy {
                    return Err(illegal(queue, tag, entry.state, "send_done"));
                }
                transition_client(tag, entry, ClientJobState::Sent);
            }
        }
        self.release_slot();
        self.kick();
        Ok(())
    }

    /// The response for a sent client job arrived.
    pub fn read_done(&mut self, tag: &Tag, response: Frame) -> Result<(), JobError> {
        let queue = QueueKind::Client;
        let entry = self.client.get_mut(tag).ok_or_else(|| JobError::UnknownJob {
            queue,
            tag: tag.clone(),
        })?;
        if entry.state != ClientJobState::Sent {
            return Err(illegal(queue, tag, entry.state, "read_done"));
        }
        entry.response = Some(response);
        transition_client(tag, entry, ClientJobState::Read);
        self.kick();
        Ok(())
    }

    /// Force a job to `Done` from any state and run its completion.
    ///
    /// A job whose frame is already being written keeps its send slot until
    /// the matching `send_done`, so the stream stays aligned. A frame that
    /// was authorized but not yet taken for writing is dropped and its slot
    /// released immediately.
    pub fn cancel(
        &mut self,
        queue: QueueKind,
        tag: &Tag,
        reason: CancelReason,
    ) -> Result<(), JobError> {
        let holds_slot = match queue {
            QueueKind::Server => {
                let entry = self
                    .server
                    .shift_remove(tag)
                    .ok_or_else(|| JobError::UnknownJob {
                        queue,
                        tag: tag.clone(),
                    })?;
                tracing::trace!(%tag, %queue, from = ?entry.state, %reason, "Job cancelled");
                let holds = entry.state == ServerJobState::Busy(ServerStage::Sending);
                entry.job.finish(tag, ServerOutcome::Cancelled(reason));
                holds
            }
            QueueKind::Client => {
                let entry = self
                    .client
                    .shift_remove(tag)
                    .ok_or_else(|| JobError::UnknownJob {
                        queue,
                        tag: tag.clone(),
                    })?;
                tracing::trace!(%tag, %queue, from = ?entry.state, %reason, "Job cancelled");
                let holds = entry.state == ClientJobState::Busy;
                entry.job.finish(tag, ClientOutcome::Cancelled(reason));
                holds
            }
        };

        let key = JobKey {
            queue,
            tag: tag.clone(),
        };
        if holds_slot {
            if let Some(pos) = self.outbox.iter().position(|o| o.key == key) {
                self.outbox.remove(pos);
                self.release_slot();
            } else {
                self.orphaned.insert(key.clone());
            }
        }
        self.completed.push(Completed {
            key,
            how: Completion::Cancelled(reason),
        });
        self.kick();
        Ok(())
    }

    /// Cancel every job in both queues, server jobs first.
    pub fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let server: Vec<Tag> = self.server.keys().cloned().collect();
        let client: Vec<Tag> = self.client.keys().cloned().collect();
        let count = server.len() + client.len();
        for tag in server {
            let _ = self.cancel(QueueKind::Server, &tag, reason);
        }
        for tag in client {
            let _ = self.cancel(QueueKind::Client, &tag, reason);
        }
        count
    }

    /// Advance every job that can legally move, server jobs first.
    ///
    /// Client jobs are only looked at once a server pass makes no progress.
    /// Safe to call at any time.
    pub fn kick(&mut self) {
        loop {
            if self.server_pass() {
                continue;
            }
            if self.client_pass() {
                continue;
            }
            break;
        }
    }

    fn server_pass(&mut self) -> bool {
        let mut progressed = false;
        let mut i = 0;
        while i < self.server.len() {
            let Some((tag, entry)) = self.server.get_index_mut(i) else {
                break;
            };
            match entry.state {
                ServerJobState::New => {
                    let next = match entry.job.execute(tag) {
                        Execution::Immediate => ServerJobState::Executed,
                        Execution::Deferred(work) => {
                            self.deferred.push((tag.clone(), work));
                            ServerJobState::Busy(ServerStage::Executing)
                        }
                    };
                    transition_server(tag, entry, next);
                    progressed = true;
                }
                ServerJobState::Executed if self.sends_in_flight < self.limits.send_budget => {
                    let frame = entry.job.send(tag);
                    self.sends_in_flight += 1;
                    self.outbox.push_back(Outbound {
                        key: JobKey {
                            queue: QueueKind::Server,
                            tag: tag.clone(),
                        },
                        frame,
                    });
                    transition_server(tag, entry, ServerJobState::Busy(ServerStage::Sending));
                    progressed = true;
                }
                ServerJobState::Sent => {
                    if let Some((tag, entry)) = self.server.shift_remove_index(i) {
                        tracing::trace!(%tag, queue = %QueueKind::Server, "Job done");
                        entry.job.finish(&tag, ServerOutcome::Sent);
                        self.completed.push(Completed {
                            key: JobKey {
                                queue: QueueKind::Server,
                                tag,
                            },
                            how: Completion::Sent,
                        });
                    }
                    progressed = true;
                    continue;
                }
                _ => {}
            }
            i += 1;
        }
        progressed
    }

    fn client_pass(&mut self) -> bool {
        let mut progressed = false;
        let mut i = 0;
        while i < self.client.len() {
            let Some((tag, entry)) = self.client.get_index_mut(i) else {
                break;
            };
            match entry.state {
                ClientJobState::New if self.sends_in_flight < self.limits.send_budget => {
                    let frame = entry.job.send(tag);
                    self.sends_in_flight += 1;
                    self.outbox.push_back(Outbound {
                        key: JobKey {
                            queue: QueueKind::Client,
                            tag: tag.clone(),
                        },
                        frame,
                    });
                    transition_client(tag, entry, ClientJobState::Busy);
                    progressed = true;
                }
                ClientJobState::Read => {
                    if let Some((tag, entry)) = self.client.shift_remove_index(i) {
                        tracing::trace!(%tag, queue = %QueueKind::Client, "Job done");
                        let completion = match entry.response {
                            Some(frame) => {
                                entry.job.finish(&tag, ClientOutcome::Response(frame));
                                Completion::Read
                            }
                            // Read is only entered with a response attached.
                            None => {
                                let reason = CancelReason::ChannelClosed;
                                entry.job.finish(&tag, ClientOutcome::Cancelled(reason));
                                Completion::Cancelled(reason)
                            }
                        };
                        self.completed.push(Completed {
                            key: JobKey {
                                queue: QueueKind::Client,
                                tag,
                            },
                            how: completion,
                        });
                    }
                    progressed = true;
                    continue;
                }
                _ => {}
            }
            i += 1;
        }
        progressed
    }

    fn release_slot(&mut self) {
        debug_assert!(self.sends_in_flight > 0, "send slot released twice");
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
    }

    /// Next frame authorized for writing, in authorization order.
    pub fn take_outbound(&mut self) -> Option<Outbound> {
        self.outbox.pop_front()
    }

    /// Deferred executions started since the last call.
    pub fn take_deferred(&mut self) -> Vec<(Tag, S::Deferred)> {
        std::mem::take(&mut self.deferred)
    }

    /// Jobs that reached `Done` since the last call.
    pub fn drain_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }

    pub fn sends_in_flight(&self) -> usize {
        self.sends_in_flight
    }

    pub fn server_len(&self) -> usize {
        self.server.len()
    }

    pub fn client_len(&self) -> usize {
        self.client.len()
    }

    pub fn server_state(&self, tag: &str) -> Option<ServerJobState> {
        self.server.get(tag).map(|e| e.state)
    }

    pub fn client_state(&self, tag: &str) -> Option<ClientJobState> {
        self.client.get(tag).map(|e| e.state)
    }

    /// Check the bookkeeping invariants. Used by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.sends_in_flight > self.limits.send_budget {
            return Err(format!(
                "{} sends in flight exceeds budget {}",
                self.sends_in_flight, self.limits.send_budget
            ));
        }
        let sending = self
            .server
            .values()
            .filter(|e| e.state == ServerJobState::Busy(ServerStage::Sending))
            .count()
            + self
                .client
                .values()
                .filter(|e| e.state == ClientJobState::Busy)
                .count()
            + self.orphaned.len();
        if sending != self.sends_in_flight {
            return Err(format!(
                "{} jobs hold send slots but {} sends in flight",
                sending, self.sends_in_flight
            ));
        }
        if self.server.values().any(|e| e.state == ServerJobState::Done)
            || self.client.values().any(|e| e.state == ClientJobState::Done)
        {
            return Err("done job left in queue".to_string());
        }
        if self.server.len() > self.limits.max_server_jobs
            || self.client.len() > self.limits.max_client_jobs
        {
            return Err("queue over capacity".to_string());
        }
        Ok(())
    }
}

fn illegal(
    queue: QueueKind,
    tag: &Tag,
    state: impl fmt::Debug,
    event: &'static str,
) -> JobError {
    JobError::IllegalTransition {
        queue,
        tag: tag.clone(),
        state: format!("{state:?}"),
        event,
    }
}

fn transition_server<S>(tag: &Tag, entry: &mut ServerEntry<S>, to: ServerJobState) {
    tracing::trace!(%tag, queue = "server", from = ?entry.state, to = ?to, "Job state");
    entry.state = to;
}

fn transition_client<C>(tag: &Tag, entry: &mut ClientEntry<C>, to: ClientJobState) {
    tracing::trace!(%tag, queue = "client", from = ?entry.state, to = ?to, "Job state");
    entry.state = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;
    use proptest::prelude::*;

    type Log = Rc<RefCell<Vec<String>>>;

    #[derive(Debug)]
    struct TestServer {
        deferred: bool,
        output: Option<String>,
        log: Log,
    }

    impl ServerJob for TestServer {
        type Deferred = ();
        type Output = String;

        fn execute(&mut self, _tag: &Tag) -> Execution<()> {
            if self.deferred {
                Execution::Deferred(())
            } else {
                self.output = Some("immediate".to_string());
                Execution::Immediate
            }
        }

        fn executed(&mut self, output: String) {
            self.output = Some(output);
        }

        fn send(&mut self, tag: &Tag) -> Frame {
            let body = self.output.take().unwrap_or_default();
            Frame::response(tag.clone(), "text/plain", body)
        }

        fn finish(self, tag: &Tag, outcome: ServerOutcome) {
            let what = match outcome {
                ServerOutcome::Sent => "sent".to_string(),
                ServerOutcome::Cancelled(r) => format!("cancelled: {r}"),
            };
            self.log.borrow_mut().push(format!("server {tag} {what}"));
        }
    }

    #[derive(Debug)]
    struct TestClient {
        log: Log,
    }

    impl ClientJob for TestClient {
        fn send(&mut self, tag: &Tag) -> Frame {
            Frame::request(tag.clone(), "text/plain", "call")
        }

        fn finish(self, tag: &Tag, outcome: ClientOutcome) {
            let what = match outcome {
                ClientOutcome::Response(f) => {
                    format!("response {}", String::from_utf8_lossy(&f.body))
                }
                ClientOutcome::Cancelled(r) => format!("cancelled: {r}"),
            };
            self.log.borrow_mut().push(format!("client {tag} {what}"));
        }
    }

    type Manager = JobManager<TestServer, TestClient>;

    fn tag(s: &str) -> Tag {
        Tag::new(s).unwrap()
    }

    fn server(log: &Log, deferred: bool) -> TestServer {
        TestServer {
            deferred,
            output: None,
            log: log.clone(),
        }
    }

    fn client(log: &Log) -> TestClient {
        TestClient { log: log.clone() }
    }

    fn response(t: &str, body: &'static str) -> Frame {
        Frame::response(tag(t), "text/plain", Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn client_round_trip() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());

        m.client_job_add(tag("1.100"), client(&log)).unwrap();
        assert_eq!(m.client_state("1.100"), Some(ClientJobState::Busy));
        let out = m.take_outbound().unwrap();
        assert_eq!(out.frame.tag.as_str(), "1.100");
        assert!(out.frame.is_request());

        m.send_done(QueueKind::Client, &tag("1.100")).unwrap();
        assert_eq!(m.client_state("1.100"), Some(ClientJobState::Sent));
        assert_eq!(m.sends_in_flight(), 0);

        m.read_done(&tag("1.100"), response("1.100", "HELLO")).unwrap();
        assert_eq!(m.client_len(), 0);
        assert_eq!(*log.borrow(), vec!["client 1.100 response HELLO"]);
        assert_eq!(
            m.drain_completed(),
            vec![Completed {
                key: JobKey {
                    queue: QueueKind::Client,
                    tag: tag("1.100")
                },
                how: Completion::Read,
            }]
        );
    }

    #[test]
    fn immediate_execute_sends_right_away() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());

        m.server_job_add(tag("s1"), server(&log, false)).unwrap();
        assert_eq!(
            m.server_state("s1"),
            Some(ServerJobState::Busy(ServerStage::Sending))
        );
        let out = m.take_outbound().unwrap();
        assert_eq!(out.frame.body, Bytes::from_static(b"immediate"));

        m.send_done(QueueKind::Server, &tag("s1")).unwrap();
        assert_eq!(m.server_len(), 0);
        assert_eq!(*log.borrow(), vec!["server s1 sent"]);
    }

    #[test]
    fn deferred_execute_waits_for_execute_done() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());

        m.server_job_add(tag("s1"), server(&log, true)).unwrap();
        assert_eq!(
            m.server_state("s1"),
            Some(ServerJobState::Busy(ServerStage::Executing))
        );
        assert_eq!(m.take_deferred().len(), 1);
        assert!(m.take_outbound().is_none());

        m.execute_done(&tag("s1"), "later".to_string()).unwrap();
        let out = m.take_outbound().unwrap();
        assert_eq!(out.frame.body, Bytes::from_static(b"later"));

        // Second completion for the same job is refused.
        assert!(matches!(
            m.execute_done(&tag("s1"), "again".to_string()),
            Err(JobError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn server_jobs_take_the_slot_first() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());

        // Occupy the only slot so both new jobs queue up behind it.
        m.client_job_add(tag("c0"), client(&log)).unwrap();
        let first = m.take_outbound().unwrap();
        m.client_job_add(tag("c1"), client(&log)).unwrap();
        m.server_job_add(tag("s1"), server(&log, false)).unwrap();
        assert_eq!(m.server_state("s1"), Some(ServerJobState::Executed));
        assert_eq!(m.client_state("c1"), Some(ClientJobState::New));

        m.send_done(QueueKind::Client, &first.key.tag).unwrap();
        let next = m.take_outbound().unwrap();
        assert_eq!(next.key.queue, QueueKind::Server);
        assert_eq!(m.client_state("c1"), Some(ClientJobState::New));

        m.send_done(QueueKind::Server, &tag("s1")).unwrap();
        let last = m.take_outbound().unwrap();
        assert_eq!(last.key.tag.as_str(), "c1");
    }

    #[test]
    fn send_budget_bounds_writes() {
        let log = Log::default();
        let limits = ManagerLimits {
            send_budget: 2,
            ..ManagerLimits::default()
        };
        let mut m = Manager::new(limits);
        for i in 0..5 {
            m.client_job_add(tag(&format!("c{i}")), client(&log)).unwrap();
        }
        assert_eq!(m.sends_in_flight(), 2);
        assert!(m.take_outbound().is_some());
        assert!(m.take_outbound().is_some());
        assert!(m.take_outbound().is_none());
        m.check_invariants().unwrap();
    }

    #[test]
    fn zero_send_budget_still_sends() {
        let log = Log::default();
        let limits = ManagerLimits {
            send_budget: 0,
            ..ManagerLimits::default()
        };
        let mut m = Manager::new(limits);
        assert_eq!(m.limits().send_budget, 1);

        m.client_job_add(tag("c1"), client(&log)).unwrap();
        assert!(m.take_outbound().is_some());
        m.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());
        m.client_job_add(tag("dup"), client(&log)).unwrap();

        let rejected = m.client_job_add(tag("dup"), client(&log)).unwrap_err();
        assert_eq!(
            rejected.error,
            JobError::DuplicateTag {
                queue: QueueKind::Client,
                tag: tag("dup")
            }
        );
        assert_eq!(m.client_len(), 1);
        assert_eq!(m.client_state("dup"), Some(ClientJobState::Busy));
    }

    #[test]
    fn queue_full_is_rejected() {
        let log = Log::default();
        let limits = ManagerLimits {
            max_server_jobs: 1,
            ..ManagerLimits::default()
        };
        let mut m = Manager::new(limits);
        m.server_job_add(tag("a"), server(&log, true)).unwrap();
        let rejected = m.server_job_add(tag("b"), server(&log, true)).unwrap_err();
        assert_eq!(
            rejected.error,
            JobError::QueueFull {
                queue: QueueKind::Server,
                limit: 1
            }
        );
    }

    #[test]
    fn stray_notifications_change_nothing() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());
        assert!(matches!(
            m.read_done(&tag("nope"), response("nope", "x")),
            Err(JobError::UnknownJob { .. })
        ));

        m.client_job_add(tag("c"), client(&log)).unwrap();
        // Response before our own send completed.
        assert!(matches!(
            m.read_done(&tag("c"), response("c", "x")),
            Err(JobError::IllegalTransition { .. })
        ));
        assert!(matches!(
            m.send_done(QueueKind::Server, &tag("c")),
            Err(JobError::UnknownJob { .. })
        ));
        assert_eq!(m.client_state("c"), Some(ClientJobState::Busy));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn cancel_while_writing_keeps_slot_until_send_done() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());
        m.client_job_add(tag("c1"), client(&log)).unwrap();
        let _writing = m.take_outbound().unwrap();
        m.client_job_add(tag("c2"), client(&log)).unwrap();

        m.cancel(QueueKind::Client, &tag("c1"), CancelReason::Timeout)
            .unwrap();
        assert_eq!(*log.borrow(), vec!["client c1 cancelled: timeout"]);
        assert_eq!(m.sends_in_flight(), 1);
        assert_eq!(m.client_state("c2"), Some(ClientJobState::New));
        m.check_invariants().unwrap();

        m.send_done(QueueKind::Client, &tag("c1")).unwrap();
        assert_eq!(m.client_state("c2"), Some(ClientJobState::Busy));
        m.check_invariants().unwrap();
    }

    #[test]
    fn cancel_before_write_drops_frame() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());
        m.client_job_add(tag("c1"), client(&log)).unwrap();
        m.cancel(QueueKind::Client, &tag("c1"), CancelReason::Timeout)
            .unwrap();
        assert_eq!(m.sends_in_flight(), 0);
        assert!(m.take_outbound().is_none());
        m.check_invariants().unwrap();
    }

    #[test]
    fn cancel_all_reports_every_job_once() {
        let log = Log::default();
        let mut m = Manager::new(ManagerLimits::default());
        m.server_job_add(tag("s1"), server(&log, true)).unwrap();
        m.client_job_add(tag("c1"), client(&log)).unwrap();
        m.client_job_add(tag("c2"), client(&log)).unwrap();

        assert_eq!(m.cancel_all(CancelReason::ChannelClosed), 3);
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(m.server_len() + m.client_len(), 0);
        assert_eq!(m.drain_completed().len(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        AddServer(u8, bool),
        AddClient(u8),
        TakeOutbound,
        SendDone(bool, u8),
        ExecuteDone(u8),
        ReadDone(u8),
        Cancel(bool, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, any::<bool>()).prop_map(|(t, d)| Op::AddServer(t, d)),
            (0u8..6).prop_map(Op::AddClient),
            Just(Op::TakeOutbound),
            (any::<bool>(), 0u8..6).prop_map(|(s, t)| Op::SendDone(s, t)),
            (0u8..6).prop_map(Op::ExecuteDone),
            (0u8..6).prop_map(Op::ReadDone),
            (any::<bool>(), 0u8..6).prop_map(|(s, t)| Op::Cancel(s, t)),
        ]
    }

    fn queue(server: bool) -> QueueKind {
        if server {
            QueueKind::Server
        } else {
            QueueKind::Client
        }
    }

    proptest! {
        #[test]
        fn random_event_orderings_keep_invariants(
            budget in 1usize..3,
            ops in proptest::collection::vec(op(), 1..80),
        ) {
            let log = Log::default();
            let limits = ManagerLimits {
                send_budget: budget,
                max_server_jobs: 4,
                max_client_jobs: 4,
            };
            let mut m = Manager::new(limits);
            let mut added = 0usize;
            let mut writing: Vec<JobKey> = Vec::new();

            for op in ops {
                match op {
                    Op::AddServer(t, d) => {
                        if m.server_job_add(tag(&format!("t{t}")), server(&log, d)).is_ok() {
                            added += 1;
                        }
                    }
                    Op::AddClient(t) => {
                        if m.client_job_add(tag(&format!("t{t}")), client(&log)).is_ok() {
                            added += 1;
                        }
                    }
                    Op::TakeOutbound => {
                        if let Some(out) = m.take_outbound() {
                            writing.push(out.key);
                        }
                    }
                    Op::SendDone(s, t) => {
                        // Only frames actually taken for writing can complete.
                        let key = JobKey { queue: queue(s), tag: tag(&format!("t{t}")) };
                        if let Some(pos) = writing.iter().position(|k| k == &key) {
                            writing.remove(pos);
                            let res = m.send_done(key.queue, &key.tag);
                            prop_assert!(res.is_ok(), "send_done refused: {:?}", res);
                        }
                    }
                    Op::ExecuteDone(t) => {
                        let _ = m.execute_done(&tag(&format!("t{t}")), "out".to_string());
                    }
                    Op::ReadDone(t) => {
                        let t = format!("t{t}");
                        let _ = m.read_done(&tag(&t), response("t0", "r"));
                    }
                    Op::Cancel(s, t) => {
                        let _ = m.cancel(queue(s), &tag(&format!("t{t}")), CancelReason::Timeout);
                    }
                }
                if let Err(e) = m.check_invariants() {
                    prop_assert!(false, "invariant violated: {}", e);
                }
                prop_assert!(m.sends_in_flight() <= budget);
            }

            // Every finished job reported exactly once.
            let finished = m.drain_completed().len();
            prop_assert_eq!(log.borrow().len(), finished);
            prop_assert_eq!(finished + m.server_len() + m.client_len(), added);
        }
    }
}
