pub mod config;
pub mod error;
pub mod model;
pub mod record;

pub use config::{Config, PolicyConfig};
pub use error::*;
pub use model::*;
pub use record::*;
