//! Types shared by the memo recorder: configuration, persisted state and
//! the control-API protocol.

pub mod catalog;
pub mod config;
pub mod protocol;
pub mod recording;
pub mod store;
