pub mod config;
pub mod fsio;
pub mod outcome;

pub use config::{Configuration, ParamDomain, ParamDomains};
pub use fsio::{atomic_write_bytes, ensure_dir};
pub use outcome::Outcome;
