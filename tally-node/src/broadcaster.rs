use crate::error::Result;
use crate::registry::{FanOut, ParticipantKey, ParticipantRegistry};
use std::sync::Arc;
use tally_common::{Message, WireFormat};
use tracing::trace;

/// Fans accepted values out to every registered participant
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ParticipantRegistry>,
    format: WireFormat,
}

impl Broadcaster {
    pub fn new(registry: Arc<ParticipantRegistry>, format: WireFormat) -> Self {
        Self { registry, format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Deliver `value` to everyone. Best effort; failed participants are
    /// pruned and reported.
    pub async fn broadcast_value(&self, value: i64) -> FanOut {
        let text = Message::Accepted(value).encode(self.format);
        let report = self.registry.fan_out(&text).await;
        trace!(
            value = value,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            "Broadcast value"
        );
        report
    }

    /// Deliver a single message to one participant
    pub async fn send_to(&self, key: ParticipantKey, message: Message) -> Result<()> {
        self.registry
            .send_to(key, &message.encode(self.format))
            .await
    }
}
