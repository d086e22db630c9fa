//! Persistent state: device registry and downlink task queue

pub mod registry;
pub mod task_queue;

pub use registry::{set_by_id, DeviceRegistry, MemoryRegistry, TxBody, Versioned};
pub use task_queue::TaskQueue;
