//! NATS JetStream backend.
//!
//! All bridge subjects live in one stream. JetStream numbers messages per
//! stream, so the per-subject sequence travels in a `Bridge-Seq` header. The
//! next value is derived from the last message stored on the subject and the
//! publish is guarded with `Nats-Expected-Last-Subject-Sequence`, so replicas
//! racing on one subject cannot hand out the same number twice. `Nats-Msg-Id`
//! makes a retried publish land in the server's duplicate window.

use crate::envelope::{Envelope, Subject, SUBJECT_PREFIX};
use crate::message_bus::{
    Acker, BusError, BusMessage, Delivery, DurableConsumer, MessageBus, PublishAck,
};
use crate::observability::events;
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer, context::PublishErrorKind, stream};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const COMPONENT: &str = "jetstream_bus";

pub const SEQUENCE_HEADER: &str = "Bridge-Seq";
pub const CORRELATION_HEADER: &str = "Bridge-Correlation-Id";
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
const EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER: &str = "Nats-Expected-Last-Subject-Sequence";

/// Concurrent writers on one subject are rare; give up after this many races.
const MAX_SEQUENCE_CONFLICTS: usize = 8;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct JetStreamBusOptions {
    pub url: String,
    pub stream_name: String,
    /// Redelivery timeout for an unacknowledged delivery.
    pub ack_wait_ms: u64,
}

impl Default for JetStreamBusOptions {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "EDGE_BRIDGE".to_string(),
            ack_wait_ms: 30_000,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SubjectCursor {
    bridge_sequence: u64,
    stream_sequence: u64,
}

#[derive(Clone)]
pub struct JetStreamBus {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: stream::Stream,
    ack_wait: Duration,
    cursors: Arc<DashMap<Subject, Arc<Mutex<Option<SubjectCursor>>>>>,
}

impl JetStreamBus {
    /// Connects to NATS and creates the bridge stream if it does not exist.
    pub async fn connect(options: &JetStreamBusOptions) -> Result<Self, BusError> {
        let client = async_nats::connect(options.url.as_str())
            .await
            .map_err(unavailable)?;
        let context = jetstream::new(client.clone());
        let stream = context
            .get_or_create_stream(stream::Config {
                name: options.stream_name.clone(),
                subjects: vec![format!("{SUBJECT_PREFIX}.>")],
                ..Default::default()
            })
            .await
            .map_err(unavailable)?;

        Ok(Self {
            client,
            context,
            stream,
            ack_wait: Duration::from_millis(options.ack_wait_ms),
            cursors: Arc::new(DashMap::new()),
        })
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        match self.client.connection_state() {
            State::Connected => Ok(()),
            state => Err(BusError::Unavailable(format!("nats connection {state:?}"))),
        }
    }

    async fn seed_cursor(&self, subject: &Subject) -> Result<SubjectCursor, BusError> {
        match self
            .stream
            .get_last_raw_message_by_subject(&subject.to_string())
            .await
        {
            Ok(last) => {
                let bridge_sequence =
                    parse_sequence(Some(&last.headers)).map_err(|reason| BusError::Malformed {
                        subject: subject.to_string(),
                        reason,
                    })?;
                Ok(SubjectCursor {
                    bridge_sequence,
                    stream_sequence: last.sequence,
                })
            }
            Err(err)
                if matches!(
                    err.kind(),
                    stream::LastRawMessageErrorKind::NoMessageFound
                ) =>
            {
                Ok(SubjectCursor {
                    bridge_sequence: 0,
                    stream_sequence: 0,
                })
            }
            Err(err) => Err(unavailable(err)),
        }
    }
}

#[async_trait]
impl MessageBus for JetStreamBus {
    async fn publish(
        &self,
        subject: &Subject,
        message: BusMessage,
    ) -> Result<PublishAck, BusError> {
        self.ensure_connected()?;

        let slot = self.cursors.entry(*subject).or_default().clone();
        let mut cursor = slot.lock().await;

        for _ in 0..MAX_SEQUENCE_CONFLICTS {
            let current = match *cursor {
                Some(current) => current,
                None => self.seed_cursor(subject).await?,
            };
            let sequence = current.bridge_sequence + 1;

            let mut headers = HeaderMap::new();
            headers.insert(SEQUENCE_HEADER, sequence.to_string().as_str());
            headers.insert(MSG_ID_HEADER, message_id(subject, sequence).as_str());
            headers.insert(
                EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER,
                current.stream_sequence.to_string().as_str(),
            );
            if let Some(correlation_id) = &message.correlation_id {
                headers.insert(CORRELATION_HEADER, correlation_id.as_str());
            }

            let pending = self
                .context
                .publish_with_headers(subject.to_string(), headers, message.payload.clone())
                .await
                .map_err(unavailable)?;

            match pending.await {
                Ok(ack) => {
                    *cursor = Some(SubjectCursor {
                        bridge_sequence: sequence,
                        stream_sequence: ack.sequence,
                    });
                    return Ok(PublishAck {
                        sequence,
                        duplicate: ack.duplicate,
                    });
                }
                Err(err) if matches!(err.kind(), PublishErrorKind::WrongLastSequence) => {
                    debug!(
                        event = events::BUS_SEQUENCE_CONFLICT,
                        component = COMPONENT,
                        subject = %subject,
                        sequence,
                        "subject advanced concurrently, reseeding sequence"
                    );
                    *cursor = None;
                }
                Err(err) => return Err(unavailable(err)),
            }
        }

        Err(BusError::Unavailable(format!(
            "lost {MAX_SEQUENCE_CONFLICTS} sequence races on {subject}"
        )))
    }

    async fn subscribe_durable(
        &self,
        subject: &Subject,
        consumer_name: &str,
    ) -> Result<Box<dyn DurableConsumer>, BusError> {
        self.ensure_connected()?;

        let durable = self
            .stream
            .get_or_create_consumer(
                consumer_name,
                consumer::pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    // Strict subject order: the next message waits for the previous ack.
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(unavailable)?;
        let messages = durable.messages().await.map_err(unavailable)?;

        Ok(Box::new(JetStreamConsumer {
            subject: *subject,
            messages,
        }))
    }

    async fn broadcast(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(unavailable)
    }

    async fn subscribe_broadcast(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Bytes>, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(unavailable)?;
        Ok(subscriber.map(|message| message.payload).boxed())
    }
}

struct JetStreamConsumer {
    subject: Subject,
    messages: consumer::pull::Stream,
}

#[async_trait]
impl DurableConsumer for JetStreamConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        loop {
            let message = match self.messages.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(unavailable(err))),
            };

            match decode(&self.subject, &message) {
                Ok(envelope) => {
                    return Some(Ok(Delivery::new(
                        envelope,
                        Box::new(JetStreamAcker { message }),
                    )))
                }
                Err(reason) => {
                    // Acked so it cannot block the subject forever.
                    warn!(
                        event = events::BUS_MALFORMED_MESSAGE,
                        component = COMPONENT,
                        subject = %self.subject,
                        reason = %reason,
                        "dropping message without bridge headers"
                    );
                    if let Err(err) = message.ack().await {
                        return Some(Err(BusError::Unavailable(err.to_string())));
                    }
                }
            }
        }
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn nak(&self) -> Result<(), BusError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }
}

fn unavailable(err: impl std::fmt::Display) -> BusError {
    BusError::Unavailable(err.to_string())
}

fn message_id(subject: &Subject, sequence: u64) -> String {
    format!("{subject}:{sequence}")
}

fn parse_sequence(headers: Option<&HeaderMap>) -> Result<u64, String> {
    let value = headers
        .and_then(|headers| headers.get(SEQUENCE_HEADER))
        .ok_or_else(|| format!("missing {SEQUENCE_HEADER} header"))?;
    value
        .as_str()
        .parse::<u64>()
        .map_err(|err| format!("invalid {SEQUENCE_HEADER} header: {err}"))
}

fn decode(expected: &Subject, message: &jetstream::Message) -> Result<Envelope, String> {
    let subject: Subject = message
        .message
        .subject
        .as_str()
        .parse()
        .map_err(|_| format!("foreign subject {}", message.message.subject))?;
    if subject != *expected {
        return Err(format!("expected {expected}, got {subject}"));
    }

    let headers = message.message.headers.as_ref();
    let sequence = parse_sequence(headers)?;
    let correlation_id = headers
        .and_then(|headers| headers.get(CORRELATION_HEADER))
        .map(|value| value.as_str().to_string());

    Ok(Envelope {
        cluster_id: subject.cluster_id,
        direction: subject.direction,
        sequence,
        correlation_id,
        payload: message.message.payload.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::{message_id, parse_sequence, JetStreamBusOptions, SEQUENCE_HEADER};
    use crate::envelope::Subject;
    use async_nats::HeaderMap;
    use uuid::Uuid;

    #[test]
    fn message_ids_are_unique_per_subject_and_sequence() {
        let subject = Subject::to_cluster(Uuid::nil());

        assert_ne!(message_id(&subject, 1), message_id(&subject, 2));
        assert!(message_id(&subject, 3).ends_with(".to_cluster:3"));
    }

    #[test]
    fn sequence_header_is_required_and_numeric() {
        assert!(parse_sequence(None).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(SEQUENCE_HEADER, "abc");
        assert!(parse_sequence(Some(&headers)).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(SEQUENCE_HEADER, "42");
        assert_eq!(parse_sequence(Some(&headers)), Ok(42));
    }

    #[test]
    fn options_parse_with_defaults() {
        let options: JetStreamBusOptions =
            serde_json::from_str(r#"{ "url": "nats://bus:4222" }"#).unwrap();

        assert_eq!(options.url, "nats://bus:4222");
        assert_eq!(options.stream_name, "EDGE_BRIDGE");
    }
}
