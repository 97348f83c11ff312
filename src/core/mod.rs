pub mod inference;
pub mod relay;
pub mod services;
pub mod session;
pub mod traits;
