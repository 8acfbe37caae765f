//! Agent nodes. Currently the CoE model picker, which chats through an
//! OpenAI-compatible backend.

pub mod coe;

pub use coe::CoeAgent;
