pub mod agent;
pub mod alert;
pub mod blobstore;
pub mod bundle;
pub mod bus;
pub mod dispatcher;
pub mod platform;
pub mod settings;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentError};
