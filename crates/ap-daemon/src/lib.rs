pub mod autopilot;
pub mod daemon;
pub mod guardrail;
pub mod logging;
pub mod manager;
pub mod project_loop;
pub mod recovery;
