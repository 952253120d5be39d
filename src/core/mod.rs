pub mod config;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transcript;
pub mod validator;

pub use config::*;
pub use orchestrator::*;
pub use parser::*;
pub use prompts::*;
pub use provider::*;
pub use queue::*;
pub use retry::*;
pub use store::*;
pub use transcript::*;
pub use validator::*;
