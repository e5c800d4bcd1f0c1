//! Supervisory hub for a single plant enclosure.
//!
//! Reads the node over its line link, asks an advisor (or the offline
//! rules) what to do, and only ever actuates what the validator approves.

pub mod advisor;
pub mod config;
pub mod control;
pub mod cycle;
pub mod db;
pub mod decision;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod link;
pub mod notify;
pub mod rate_limit;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod validator;
pub mod web;
