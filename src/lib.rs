//! Straggler - latency straggler detector for instrumented processes
//!
//! This library watches a configured set of call sites inside a running,
//! multi-threaded program and reports every invocation that runs longer
//! than its call site's threshold, optionally with the nested calls seen
//! while it was in flight. An instrumentation layer drives it through the
//! entry/exit and thread-lifecycle hooks on [`monitor::StragglerMonitor`].

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod monitor;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod slot;
pub mod slot_table;
pub mod stats;
pub mod trace;
