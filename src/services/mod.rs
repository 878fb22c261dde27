pub mod batch_queue;
pub mod dedup;
pub mod generator;
pub mod processor;
pub mod publish;
pub mod reconcile;
pub mod tenant_policy;
pub mod watchdog;
