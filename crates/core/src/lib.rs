//! secmgr core: configuration, errors, and the authentication session state machine.

pub mod codec;
pub mod config;
pub mod error;
pub mod session;
