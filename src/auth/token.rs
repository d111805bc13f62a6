//! Token models: the cached identity token, the ambient access credential, and the redacted
//! secret wrapper both of them carry.

pub mod access;
pub mod record;
pub mod secret;
