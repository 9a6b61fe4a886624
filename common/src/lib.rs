pub mod config;
pub mod frame;

pub use config::{Config, ConfigError};
pub use frame::{Frame, MotionEvent};
