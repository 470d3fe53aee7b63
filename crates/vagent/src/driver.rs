//! Event loop that runs a [`Channel`] over a real stream.
//!
//! One task, one `select!`: socket reads, the current write, call timers,
//! deferred method executions and commands from [`AgentHandle`]s. The
//! channel is only ever touched from this task.
//!
//! [`AgentHandle`]: crate::client::AgentHandle

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use vagent_bridge::Tag;

use crate::channel::{Channel, Event, Output};
use crate::client::Command;
use crate::codec::Reply;
use crate::config::Role;
use crate::server::DeferredReply;

const READ_BUF_LEN: usize = 16 * 1024;

/// Pause before reading again after the guest saw end-of-file or an error.
pub const GUEST_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer closed the channel")]
    Closed,

    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

struct Timers {
    queue: DelayQueue<Tag>,
    keys: HashMap<Tag, delay_queue::Key>,
}

impl Timers {
    fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    fn arm(&mut self, tag: Tag, after: Duration) {
        let key = self.queue.insert(tag.clone(), after);
        if let Some(old) = self.keys.insert(tag, key) {
            self.queue.remove(&old);
        }
    }

    fn disarm(&mut self, tag: &Tag) {
        if let Some(key) = self.keys.remove(tag) {
            self.queue.remove(&key);
        }
    }
}

async fn execute(tag: Tag, work: DeferredReply) -> (Tag, Reply) {
    (tag, work.await)
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: Option<Bytes>) -> io::Result<usize> {
    match chunk {
        Some(chunk) => writer.write(&chunk).await,
        None => std::future::pending().await,
    }
}

/// Run `channel` over `stream` until `shutdown` fires or, on the host, the
/// stream fails.
///
/// The guest never gives up on its stream: after end-of-file or an error it
/// waits [`GUEST_RETRY_BACKOFF`] and reads again, since the host may
/// reconnect to the same port. The host cancels every outstanding job and
/// returns the error.
pub async fn run<S>(
    stream: S,
    mut channel: Channel,
    mut commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut rbuf = BytesMut::with_capacity(READ_BUF_LEN);
    let mut timers = Timers::new();
    let mut executing = FuturesUnordered::new();
    let mut commands_open = true;
    let role = channel.role();

    tracing::info!(%role, "Channel running");

    loop {
        while let Some(output) = channel.poll_output() {
            match output {
                Output::ArmTimer { tag, after } => timers.arm(tag, after),
                Output::DisarmTimer { tag } => timers.disarm(&tag),
                Output::Execute { tag, work } => executing.push(execute(tag, work)),
            }
        }
        let chunk = channel.poll_transmit();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Channel shutting down");
                channel.step(Event::Disconnected);
                return Ok(());
            }

            res = write_chunk(&mut writer, chunk) => {
                match res {
                    Ok(0) => {
                        let err = io::Error::from(io::ErrorKind::WriteZero);
                        channel.step(Event::SendFailed);
                        fail(role, &mut channel, err).await?;
                    }
                    Ok(n) => channel.transmitted(n),
                    Err(e) => {
                        channel.step(Event::SendFailed);
                        fail(role, &mut channel, e).await?;
                    }
                }
            }

            res = reader.read_buf(&mut rbuf) => {
                match res {
                    Ok(0) => {
                        channel.handle_eof(&mut rbuf)?;
                        match role {
                            Role::Host => {
                                tracing::error!("Peer closed the channel");
                                channel.step(Event::Disconnected);
                                return Err(ChannelError::Closed);
                            }
                            Role::Guest => {
                                tracing::debug!("End of stream, waiting for host");
                                tokio::time::sleep(GUEST_RETRY_BACKOFF).await;
                            }
                        }
                    }
                    Ok(n) => {
                        tracing::trace!(bytes = n, "Read");
                        channel.handle_input(&mut rbuf)?;
                    }
                    Err(e) => {
                        channel.handle_eof(&mut rbuf)?;
                        fail(role, &mut channel, e).await?;
                    }
                }
            }

            Some(expired) = timers.queue.next(), if !timers.queue.is_empty() => {
                let tag = expired.into_inner();
                timers.keys.remove(&tag);
                channel.step(Event::TimerFired(tag));
            }

            Some((tag, reply)) = executing.next(), if !executing.is_empty() => {
                channel.step(Event::ExecuteFinished { tag, reply });
            }

            cmd = commands.recv(), if commands_open => {
                match cmd {
                    Some(Command::Call { method, params, timeout, reply }) => {
                        let callback = Box::new(move |result| {
                            let _ = reply.send(result);
                        });
                        // Rejections are already delivered through the callback.
                        let _ = channel.invoke(&method, params, timeout, callback);
                    }
                    None => {
                        tracing::debug!("All handles dropped");
                        commands_open = false;
                    }
                }
            }
        }
    }
}

/// Apply the role's policy to a hard I/O error.
async fn fail(role: Role, channel: &mut Channel, err: io::Error) -> Result<(), ChannelError> {
    match role {
        Role::Host => {
            tracing::error!(error = %err, "Channel failed");
            channel.step(Event::Disconnected);
            Err(ChannelError::Io(err))
        }
        Role::Guest => {
            tracing::warn!(error = %err, "Channel error, retrying");
            tokio::time::sleep(GUEST_RETRY_BACKOFF).await;
            Ok(())
        }
    }
}
