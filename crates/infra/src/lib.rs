//! Infrastructure layer: job storage, submission, orchestration, config and
//! capability adapters.

pub mod accounts;
pub mod adapters;
pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod service;

#[cfg(test)]
mod integration_tests;
