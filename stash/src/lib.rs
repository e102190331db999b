// Library interface for stash modules
// This allows tests and the operator binaries to import modules

pub mod auth;
pub mod extraction;
pub mod llm;
pub mod pipeline;
pub mod scraping;
pub mod server;
pub mod storage;
