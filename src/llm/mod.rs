#[cfg(feature = "openai")]
pub mod client;
pub mod generator;
pub mod guard;
pub mod prompts;
pub mod rate_limiter;
pub mod types;

#[cfg(feature = "openai")]
pub use client::*;
pub use generator::*;
pub use guard::*;
pub use rate_limiter::*;
pub use types::*;
