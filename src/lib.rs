//! Flow nodes that discover models and tools published by remote HTTP
//! services, let a user pick one from a dynamically filled dropdown and
//! invoke it.

pub mod agent;
pub mod build_config;
pub mod config;
pub mod endpoint;
pub mod http;
pub mod logger;
pub mod message;
pub mod node;
pub mod options;
pub mod schema;
pub mod tools;
