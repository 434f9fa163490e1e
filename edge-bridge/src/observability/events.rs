//! Canonical structured event names used across `edge-bridge`.

// Connection registry events.
pub const CONNECTION_INSTALLED: &str = "connection_installed";
pub const CONNECTION_EVICTED: &str = "connection_evicted";
pub const CONNECTION_REMOVED: &str = "connection_removed";
pub const CONNECTION_REMOVE_STALE_IGNORED: &str = "connection_remove_stale_ignored";
pub const CONNECTION_INSTALL_FENCED: &str = "connection_install_fenced";
pub const CLUSTER_REGISTERED: &str = "cluster_registered";

// Stream adapter events.
pub const ADAPTER_START: &str = "adapter_start";
pub const ADAPTER_TEARDOWN: &str = "adapter_teardown";
pub const ADAPTER_GRACE_EXPIRED: &str = "adapter_grace_expired";
pub const INBOUND_FRAME: &str = "inbound_frame";
pub const INBOUND_KEEPALIVE: &str = "inbound_keepalive";
pub const INBOUND_PUBLISH_OK: &str = "inbound_publish_ok";
pub const INBOUND_PUBLISH_FAILED: &str = "inbound_publish_failed";
pub const INBOUND_STALE_DISCARDED: &str = "inbound_stale_discarded";
pub const INBOUND_STREAM_CLOSED: &str = "inbound_stream_closed";
pub const OUTBOUND_WRITE_OK: &str = "outbound_write_ok";
pub const OUTBOUND_WRITE_TIMEOUT: &str = "outbound_write_timeout";
pub const OUTBOUND_STALE_WRITER: &str = "outbound_stale_writer";
pub const OUTBOUND_ACK_FAILED: &str = "outbound_ack_failed";
pub const OUTBOUND_RELEASED: &str = "outbound_released";
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

// Message bus events.
pub const BUS_PUBLISH_TIMEOUT: &str = "bus_publish_timeout";
pub const BUS_SUBSCRIBE_OK: &str = "bus_subscribe_ok";
pub const BUS_SUBSCRIBE_FAILED: &str = "bus_subscribe_failed";
pub const BUS_SUBSCRIPTION_LOST: &str = "bus_subscription_lost";
pub const BUS_DUPLICATE_SKIPPED: &str = "bus_duplicate_skipped";
pub const BUS_MALFORMED_MESSAGE: &str = "bus_malformed_message";
pub const BUS_SEQUENCE_CONFLICT: &str = "bus_sequence_conflict";

// Bridge service events.
pub const CONNECT_START: &str = "connect_start";
pub const CONNECT_OK: &str = "connect_ok";
pub const CONNECT_REJECTED: &str = "connect_rejected";
pub const REGISTER_DEPLOYMENT_OK: &str = "register_deployment_ok";
pub const REGISTER_DEPLOYMENT_FAILED: &str = "register_deployment_failed";
pub const INSTALL_RECORDED: &str = "install_recorded";
pub const TAKEOVER_ANNOUNCED: &str = "takeover_announced";
pub const TAKEOVER_ANNOUNCE_FAILED: &str = "takeover_announce_failed";
pub const TAKEOVER_REMOTE_EVICTION: &str = "takeover_remote_eviction";
pub const TAKEOVER_NOTICE_MALFORMED: &str = "takeover_notice_malformed";
pub const SHUTDOWN: &str = "shutdown";

// Runtime events.
pub const RETRY_SCHEDULED: &str = "retry_scheduled";
pub const RETRY_EXHAUSTED: &str = "retry_exhausted";
pub const RETRY_ABANDONED: &str = "retry_abandoned";
