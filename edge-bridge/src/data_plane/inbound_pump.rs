//! Edge stream to bus direction of a stream adapter.

use crate::control_plane::connection::Connection;
use crate::data_plane::edge_stream::{EdgeFrame, StreamError};
use crate::envelope::Subject;
use crate::error::TeardownReason;
use crate::message_bus::{BusAdapter, BusError, BusMessage, PublishAck};
use crate::observability::{events, fields};
use crate::runtime::backoff::{retry_with_backoff, RetryPolicy};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn, Level};

const COMPONENT: &str = "inbound_pump";

#[derive(Debug, Error)]
enum PublishAttemptError {
    #[error("generation superseded")]
    Superseded,
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes every data frame of `inbound` to the cluster's `from_cluster`
/// subject, in arrival order, until the connection closes.
pub(crate) async fn run_inbound(
    connection: Arc<Connection>,
    mut inbound: BoxStream<'static, Result<EdgeFrame, StreamError>>,
    bus: BusAdapter,
    publish_retry: RetryPolicy,
) {
    let cluster_id = connection.cluster_id();
    let generation = connection.generation();
    let subject = Subject::from_cluster(cluster_id);

    loop {
        let next = tokio::select! {
            biased;
            _ = connection.closed() => return,
            next = inbound.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            None | Some(Err(StreamError::Closed)) => {
                debug!(
                    event = events::INBOUND_STREAM_CLOSED,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    "edge closed the stream"
                );
                connection.close(TeardownReason::StreamClosed);
                return;
            }
            Some(Err(StreamError::Transport(detail))) => {
                debug!(
                    event = events::INBOUND_STREAM_CLOSED,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    err = %detail,
                    "edge stream failed"
                );
                connection.close(TeardownReason::StreamError(detail));
                return;
            }
        };

        connection.touch();

        let (correlation_id, payload) = match frame {
            EdgeFrame::Keepalive => {
                debug!(
                    event = events::INBOUND_KEEPALIVE,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    "keepalive"
                );
                continue;
            }
            EdgeFrame::Data {
                correlation_id,
                payload,
            } => (correlation_id, payload),
        };

        if tracing::enabled!(Level::DEBUG) {
            debug!(
                event = events::INBOUND_FRAME,
                component = COMPONENT,
                cluster_id = %cluster_id,
                generation,
                correlation_id = %fields::format_correlation_id(correlation_id.as_deref()),
                payload_len = payload.len(),
                "publishing inbound frame"
            );
        }

        let message = BusMessage::new(correlation_id, payload);
        let attempts = retry_with_backoff(
            &publish_retry,
            "publish_inbound",
            || connection.is_current() && !connection.is_closed(),
            || publish_if_current(&connection, &bus, &subject, message.clone()),
        );
        let published = match tokio::select! {
            biased;
            _ = connection.closed() => Err(PublishAttemptError::Superseded),
            published = attempts => published,
        } {
            // Retries abandoned because the generation went stale.
            Err(PublishAttemptError::Bus(_)) if !connection.is_current() => {
                Err(PublishAttemptError::Superseded)
            }
            published => published,
        };

        match published {
            Ok(ack) => {
                debug!(
                    event = events::INBOUND_PUBLISH_OK,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    subject = %subject,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "inbound frame published"
                );
            }
            Err(PublishAttemptError::Superseded) => {
                debug!(
                    event = events::INBOUND_STALE_DISCARDED,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    "discarding frame from superseded or closed generation"
                );
                return;
            }
            Err(PublishAttemptError::Bus(err)) => {
                warn!(
                    event = events::INBOUND_PUBLISH_FAILED,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    subject = %subject,
                    err = %err,
                    "publish retries exhausted, tearing connection down"
                );
                connection.close(TeardownReason::BusUnavailable(err.to_string()));
                return;
            }
        }
    }
}

/// One publish attempt. Refused once a newer generation owns the cluster, so a
/// retry scheduled before a takeover never lands after it.
async fn publish_if_current(
    connection: &Connection,
    bus: &BusAdapter,
    subject: &Subject,
    message: BusMessage,
) -> Result<PublishAck, PublishAttemptError> {
    if !connection.is_current() {
        return Err(PublishAttemptError::Superseded);
    }
    Ok(bus.publish(subject, message).await?)
}
