//! The diff-apply worker pool.
//!
//! [`targets_for_dir`] turns a directory tree into groups of targets, one
//! group per server. [`run_worker_pool`] hands the groups to a fixed number of
//! workers; each worker diffs its targets against their desired schemas,
//! lints and prints the DDL and, outside dry runs, executes it.
//!
//! A failed statement on a live database stops the remaining statements for
//! that database. Statements that already ran are not rolled back.

mod printer;
mod result;
mod target;
mod verify;
mod worker;

pub use printer::Printer;
pub use result::{ApplyResult, sum_results};
pub use target::{Target, TargetGroup, targets_for_dir};
pub use verify::verify_diff;
pub use worker::{TargetGroupQueue, run_worker_pool, worker};
