pub mod config;
pub mod job;
pub mod report;
pub mod result;
pub mod schema;

pub use config::*;
pub use job::*;
pub use report::*;
pub use result::*;
pub use schema::*;
