pub mod client;
pub mod executor;
pub mod worker;
