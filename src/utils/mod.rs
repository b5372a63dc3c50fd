pub mod parsers;

pub use parsers::{parse_clock_time, parse_memory_gb};
