pub mod coordinator;
pub mod shared;
pub mod worker;
