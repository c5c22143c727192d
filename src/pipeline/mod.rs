// src/pipeline/mod.rs
pub mod consolidator;
pub mod labels;
pub mod model;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod validator;

pub use runner::{acquire_reports, CompanyRunner};
