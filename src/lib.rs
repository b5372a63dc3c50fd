pub mod agent;
pub mod api;
pub mod config;
pub mod core;
pub mod master;
pub mod runtime;
pub mod utils;

pub use crate::core::error::{LabGpuError, Result};
