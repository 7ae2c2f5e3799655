pub mod metric_publisher;
pub mod mqtt;
