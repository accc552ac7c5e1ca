//! Process lifecycle: signals, restart handover and the supervised workload.

pub mod restart;
pub mod shutdown;
pub mod workload;
