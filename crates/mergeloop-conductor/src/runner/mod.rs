pub mod event_log;
pub mod feedback;
pub mod merge;
pub mod notify;
pub mod orchestrate;
pub mod report;
pub mod review;
pub mod testgen;
pub mod validate;
