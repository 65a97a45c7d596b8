// Capabilities the channel requires of a connected consumer.
use serde::{Deserialize, Serialize};
use weir_common::ids::ClientId;

/// A connected subscriber, registered with a channel by id. The channel
/// never manages a consumer's lifecycle; it only signals state changes
/// through these methods.
pub trait Consumer: Send + Sync {
    fn pause(&self);
    fn unpause(&self);
    /// Forcibly closes the consumer's connection.
    fn close(&self);
    /// Signals that an in-flight message owned by this consumer timed out
    /// and was returned to the channel.
    fn timed_out_message(&self);
    /// Asks the consumer to discard its own buffered messages.
    fn empty(&self);
    fn stats(&self, topic_name: &str) -> ConsumerStats;
}

/// Point-in-time counters a consumer reports for admin surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub client_id: ClientId,
    pub ready_count: i64,
    pub in_flight_count: i64,
    pub message_count: u64,
    pub finish_count: u64,
    pub requeue_count: u64,
}
