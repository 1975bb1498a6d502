pub mod context;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod system;

pub use error::{ApiError, ErrorResponse};
pub use routes::{create_router, AppState};
