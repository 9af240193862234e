//! Infrastructure layer: stores, leader election, queueing, dispatch and delivery.

pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatcher;
pub mod intake;
pub mod jobs;
pub mod leader;
pub mod monitor;
pub mod queue;
pub mod workers;

#[cfg(test)]
mod testing;
