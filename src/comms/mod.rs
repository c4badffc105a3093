pub mod local_api;

pub use local_api::{create_router, serve, AppState};
