pub mod agent;
pub mod config;
pub mod executor;
pub mod http;
pub mod model;
pub mod scheduled;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telegram;
pub mod utils;

pub use config::Config;
pub use model::{DeliveryMode, Run, RunStatus, ThreadKey};
pub use scheduler::{InProcessScheduler, RunScheduler};
pub use service::RunService;
pub use store::Store;
pub use utils::errors::CoordinatorError;
pub use utils::setup_logging;
