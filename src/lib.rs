//! Loopcast engine: plays a text playlist into a live stream, one entry at a
//! time, and publishes a schedule of what is coming up and what just aired.

pub mod alerts;
pub mod api;
pub mod budget;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod history;
pub mod media;
pub mod playlist;
pub mod publish;
pub mod retry;
pub mod schedule;
pub mod state_store;
pub mod supervisor;
