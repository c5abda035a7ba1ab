//! Lock-free queues that can live in shared memory.

mod sofi;

pub use sofi::{SoFi, SoFiValue};
