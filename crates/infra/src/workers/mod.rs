//! Long-lived background tasks and their control handles.

mod task;

pub use task::{ShutdownSignal, TaskHandle, spawn_periodic};
