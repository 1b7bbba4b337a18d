pub mod activity;
pub mod api;
pub mod api_types;
pub mod archive;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod executor;
pub mod hierarchy;
pub mod order;
pub mod policy;
pub mod portal;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{PortalError, Result};
pub use portal::Portal;
