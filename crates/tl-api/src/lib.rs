pub mod auth;
pub mod error;
pub mod rest;
pub mod router;
pub mod state;

pub use router::build_router;
pub use state::AppState;
