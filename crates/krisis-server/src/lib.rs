pub mod backend;
pub mod config;
pub mod limit;
mod server;

pub use backend::*;
pub use config::*;
pub use limit::{RateCounterError, RateCounterStore, Tier};
pub use server::{ServerError, build_router, serve};
