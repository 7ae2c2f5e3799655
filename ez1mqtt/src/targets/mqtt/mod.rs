pub mod discovery;
pub mod homa;
#[allow(clippy::module_inception)]
pub mod mqtt;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod topic_mapper;
