pub mod usage_api;

pub use usage_api::router;
