/// HTTP surface for field devices
///
/// This module provides:
/// - Location pulse ingestion
/// - Attendance clock-in/clock-out
/// - Transaction screening and per-agent history
/// - Bearer token authentication (token subject = agent id)
pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod server;

pub use auth::AuthService;
pub use handlers::AppState;
pub use middleware::AgentIdentity;
pub use models::{ClockInRequest, ErrorResponse, PulseRequest, ScreenRequest};
pub use server::{ApiConfig, ApiServer};
