pub mod queue;
pub mod slack;
