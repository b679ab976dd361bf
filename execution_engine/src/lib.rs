pub use crate::{
    execution_engine::{ExecutionEngine, MockExecutionEngine},
    types::{PayloadStatusV1, PayloadValidationStatus},
};

mod execution_engine;
mod types;
