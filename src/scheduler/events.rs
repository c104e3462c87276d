//! Lifecycle notifications for one named queue.
//!
//! Events travel over the queue's pub/sub channel (`{prefix}:{queue}:events`)
//! as JSON objects tagged by an `event` field:
//!
//! ```text
//! {"event":"completed","jobId":"12","returnValue":{"sent":true}}
//! {"event":"failed","jobId":"13","reason":"SMTP timeout","attemptsMade":3}
//! ```
//!
//! [`QueueEvents`] only ever subscribes through a [`SubscriberConnection`],
//! never through the command connection. A dropped subscription is reopened
//! on the same channel; the stream ends only when the broker closes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{future, stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::keys::QueueKeys;
use crate::broker::SubscriberConnection;
use crate::error::{BrokerError, QueueError};

/// First delay before resubscribing after a failed attempt.
const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the delay between resubscribe attempts.
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// A job lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    /// The job was recorded and is waiting.
    Added { job_id: String, name: String },
    Completed {
        job_id: String,
        #[serde(default)]
        return_value: serde_json::Value,
    },
    /// The job failed its last allowed attempt.
    Failed {
        job_id: String,
        reason: String,
        attempts_made: u32,
    },
    /// The worker lost the job while it was active.
    Stalled { job_id: String, reason: String },
    /// The job failed and will run again after `delay_ms`.
    Retrying {
        job_id: String,
        reason: String,
        delay_ms: u64,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Added { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Stalled { job_id, .. }
            | JobEvent::Retrying { job_id, .. } => job_id,
        }
    }

    /// Short name of the transition, as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Added { .. } => "added",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Stalled { .. } => "stalled",
            JobEvent::Retrying { .. } => "retrying",
        }
    }

    /// Failure reason for failed, stalled and retrying events.
    pub fn reason(&self) -> Option<&str> {
        match self {
            JobEvent::Failed { reason, .. }
            | JobEvent::Stalled { reason, .. }
            | JobEvent::Retrying { reason, .. } => Some(reason),
            JobEvent::Added { .. } | JobEvent::Completed { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decodes a message received on `channel`, keeping it only if it was
/// published on `expected`.
pub(crate) fn decode_message(expected: &str, channel: &str, payload: &str) -> Option<JobEvent> {
    if channel != expected {
        debug!(channel = %channel, expected = %expected, "Ignoring message from foreign channel");
        return None;
    }

    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Skipping malformed queue event");
            None
        }
    }
}

/// Event subscription bound to one queue.
#[derive(Clone)]
pub struct QueueEvents {
    queue: String,
    channel: String,
    subscriber: SubscriberConnection,
}

impl QueueEvents {
    /// Binds the stream to `queue` on the given subscribe-only connection.
    pub fn new(queue: &str, prefix: &str, subscriber: SubscriberConnection) -> Self {
        Self {
            queue: queue.to_string(),
            channel: QueueKeys::new(prefix, queue).events(),
            subscriber,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Pub/sub channel the events arrive on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Opens a dedicated subscription and returns the stream of events.
    ///
    /// If the subscription connection drops, the stream resubscribes to the
    /// same channel, waiting between attempts as the command connection does.
    /// It ends only when the broker is closed. Pub/sub is not durable: events
    /// published while no subscription is open are not replayed.
    ///
    /// # Errors
    ///
    /// The first subscription is opened before returning, so a closed or
    /// unreachable broker is reported here.
    pub async fn subscribe(&self) -> Result<EventStream, QueueError> {
        let (first, closed) = open_session(&self.subscriber, &self.channel).await?;

        let subscriber = self.subscriber.clone();
        let channel = self.channel.clone();
        let reconnect = move || {
            let subscriber = subscriber.clone();
            let channel = channel.clone();
            async move { open_session(&subscriber, &channel).await.map(|(session, _)| session) }
        };

        Ok(EventStream {
            inner: Box::pin(resubscribing(first, reconnect, closed)),
        })
    }
}

/// Events of one subscription connection.
type Session<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

async fn open_session(
    subscriber: &SubscriberConnection,
    channel: &str,
) -> Result<(Session<JobEvent>, watch::Receiver<bool>), BrokerError> {
    let (pubsub, closed) = subscriber.subscribe(channel).await?;
    let expected = channel.to_string();

    let events = pubsub.into_on_message().filter_map(move |msg| {
        let event = match msg.get_payload::<String>() {
            Ok(payload) => decode_message(&expected, msg.get_channel_name(), &payload),
            Err(e) => {
                warn!(error = %e, "Skipping non-text queue event");
                None
            }
        };
        future::ready(event)
    });

    Ok((Box::pin(events), closed))
}

/// Chains `first` with sessions from `reconnect`, opened each time the
/// previous one ends, until `closed` flips or `reconnect` reports the broker
/// closed.
fn resubscribing<T, C, F>(
    first: Session<T>,
    reconnect: C,
    mut closed: watch::Receiver<bool>,
) -> impl Stream<Item = T> + Send
where
    T: Send + 'static,
    C: FnMut() -> F + Send + 'static,
    F: Future<Output = Result<Session<T>, BrokerError>> + Send + 'static,
{
    let stop = async move {
        let _ = closed.wait_for(|closed| *closed).await;
    };

    let later = stream::unfold(reconnect, |mut reconnect| async move {
        warn!("Event subscription dropped, resubscribing");
        let mut delay = INITIAL_RESUBSCRIBE_DELAY;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match reconnect().await {
                Ok(session) => {
                    info!(attempt, "Event subscription restored");
                    return Some((session, reconnect));
                }
                Err(e) if e.is_closed() => return None,
                Err(e) => {
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Event subscription not restored yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                }
            }
        }
    });

    stream::once(future::ready(first))
        .chain(later)
        .flatten()
        .take_until(stop)
}

/// Stream of lifecycle events for one queue.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = JobEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
