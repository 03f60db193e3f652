//! Statement execution: admission, status convergence, result
//! materialization and the streaming loop.

mod coordinator;
mod cursor;
mod row_limit;
mod rows;
mod snapshot;
mod subscription;

pub use coordinator::{ExecutionCoordinator, StatementRun};
pub use row_limit::{AlwaysContinue, RowLimitPolicy, StopAtLimit};
pub use rows::ResultRows;
pub use snapshot::{ExecutionError, ExecutionEvent, ResultSnapshot, TerminalStatus};
pub use subscription::StatementKey;
