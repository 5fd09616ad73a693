pub mod config;
pub mod exec;
pub mod host;
pub mod oracle;
pub mod plan;
pub mod runner;
pub mod state;
pub mod store;
pub mod testrun;
