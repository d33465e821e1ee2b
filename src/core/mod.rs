pub mod error;
pub mod types;

pub use error::{FleetError, Result};
pub use types::{
    ChunkStatus, HealthState, InvocationDescriptor, OperationChunk, OperationRecord,
    OperationStatus, OperationUpdate, RetryPolicy, ServerStatus, Target, new_operation_id,
};
