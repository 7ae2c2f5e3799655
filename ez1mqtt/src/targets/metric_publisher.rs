use crate::error::PublishError;
use crate::reading::{PowerSettings, Reading};

pub trait MetricPublisher {
    /// Publishes one reading. Failures are returned, not raised: one broken
    /// topic never stops the others.
    fn publish(&mut self, reading: &Reading) -> Vec<PublishError>;

    fn publish_power_settings(&mut self, settings: &PowerSettings) -> Vec<PublishError>;
}
