use crate::control_plane::connection::Connection;
use crate::error::TeardownReason;
use crate::observability::events;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::warn;

const COMPONENT: &str = "heartbeat";

/// Tears the connection down once no inbound frame arrived for `timeout`.
pub(crate) async fn run_heartbeat(connection: Arc<Connection>, timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = connection.closed() => return,
            _ = ticker.tick() => {}
        }

        let idle = connection.idle_for();
        if idle >= timeout {
            warn!(
                event = events::HEARTBEAT_TIMEOUT,
                component = COMPONENT,
                cluster_id = %connection.cluster_id(),
                generation = connection.generation(),
                idle_ms = idle.as_millis() as u64,
                "no frame from edge within heartbeat timeout"
            );
            connection.close(TeardownReason::HeartbeatTimeout(timeout));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::run_heartbeat;
    use crate::control_plane::connection::{Connection, StreamHandle};
    use crate::error::TeardownReason;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn connection() -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(
            Uuid::new_v4(),
            1,
            1,
            Arc::new(AtomicU64::new(1)),
            StreamHandle::new(tx),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed() {
        let connection = connection();

        run_heartbeat(
            connection.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(
            connection.reason(),
            Some(&TeardownReason::HeartbeatTimeout(Duration::from_secs(30)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_connection_alive() {
        let connection = connection();
        let watchdog = tokio::spawn(run_heartbeat(
            connection.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            connection.touch();
        }
        assert!(!connection.is_closed());

        connection.close(TeardownReason::Shutdown);
        watchdog.await.unwrap();
        assert_eq!(connection.reason(), Some(&TeardownReason::Shutdown));
    }
}
