//! Tasksmith: task scheduling and execution core for autonomous coding agents.
//!
//! A persistent, dependency-aware task queue feeding a bounded worker pool
//! that runs each task in its own workspace.

pub mod config;
pub mod error;
pub mod queue;
pub mod worker;
pub mod workspace;
