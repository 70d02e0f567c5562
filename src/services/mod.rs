pub mod artifacts;
pub mod enricher;
pub mod fetcher;
pub mod pipeline;
pub mod planner;
pub mod universe;
pub mod writer;
