pub mod analyze;
pub mod init;
pub mod schema;
pub mod serve;
pub mod status;

pub use analyze::*;
pub use init::*;
pub use schema::*;
pub use serve::*;
pub use status::*;
