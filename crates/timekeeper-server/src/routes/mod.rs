pub mod command;
pub mod config;
pub mod escalations;
pub mod events;
pub mod timers;
