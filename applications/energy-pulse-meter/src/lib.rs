pub mod batch;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event_loop;
pub mod gpio;
pub mod pulse;
pub mod shutdown;
pub mod tariff;

pub use config::Config;
pub use error::{AppError, Result};
