pub mod types;
pub mod error;
pub mod time;
pub mod data;
pub mod events;
pub mod config;
pub mod utils;

pub use types::*;
pub use error::{CandleError, Result};
