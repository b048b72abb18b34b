pub mod chart;
pub mod db_connector;
pub mod detect;
pub mod excel;
pub mod export;
pub mod frame;
pub mod loader;
pub mod processor;
pub mod profiler;
pub mod stats;
