//! SQLite helpers shared by the server store and the local call store

pub mod init;
pub mod settings;

pub use init::*;
pub use settings::*;
