pub mod anomaly;
pub mod attendance;
pub mod cache;
#[cfg(feature = "api")]
pub mod cli;
pub mod compliance;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod geo;
pub mod persistence;
pub mod test_utils;
pub mod types;
pub mod zone_state;

#[cfg(feature = "api")]
pub mod api;

pub use config::AppConfig;
pub use engine::{FieldEngine, PulseOutcome, Services};
pub use error::{FieldError, FieldResult};
pub use persistence::Persistence;
