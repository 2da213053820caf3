pub mod auth;
pub mod control;
pub mod driver;
pub mod event_bus;
pub mod git;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod snapshot;
pub mod webhook;
