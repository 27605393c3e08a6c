pub mod auth;
pub mod engagement;

pub use auth::{Claims, JwtService, TokenVerifier};
pub use engagement::{EngagementService, InMemoryEngagement};
