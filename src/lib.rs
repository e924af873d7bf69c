pub mod limits;
pub mod model;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod wal;
pub mod worker;
