pub mod batches;
pub mod system;
