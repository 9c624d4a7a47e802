//! devlog: relays browser console output into log files through a
//! native-messaging host, and retargets browser manifests per logging session.

pub mod codec;
pub mod config;
pub mod host;
pub mod logger;
pub mod manifest;
pub mod models;
pub mod relay;
pub mod session;
