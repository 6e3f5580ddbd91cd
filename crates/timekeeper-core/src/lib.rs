pub mod config;
pub mod control;
pub mod duration;
pub mod error;
pub mod io;
pub mod parser;
pub mod phrase;
pub mod types;

pub use error::{Result, TimekeeperError};
