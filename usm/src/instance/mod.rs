//! Service instances: status model and the table that owns them.

mod state;
mod table;

pub use state::{FailureCause, RestartStage, ServiceInstance, ServiceStatus};
pub use table::{InstanceDescriptor, InstanceTable, StatusCounts};

pub(crate) use table::{InstanceSlot, InstanceState};
