pub mod builder;
pub mod cadence;
pub mod config;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod reliability;
pub mod scheduler;
pub mod storage;
