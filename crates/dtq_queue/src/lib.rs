pub mod aliveness;
pub mod balancing_queue;
pub mod bucket_queue;
pub mod enqueuer;
pub mod queue;
pub mod runner;
pub mod splitter;
pub mod termination;
pub mod worker_configurations;
