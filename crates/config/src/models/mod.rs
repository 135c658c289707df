pub mod api_observability;
pub mod app_config;
pub mod broker;
pub mod database;
pub mod pipeline;
pub mod worker;

pub use api_observability::*;
pub use app_config::*;
pub use broker::*;
pub use database::*;
pub use pipeline::*;
pub use worker::*;
