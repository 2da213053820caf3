pub mod executor;
pub mod planner;
pub mod prompts;
pub mod spawn_config;
pub mod spawner;
pub mod stream;
