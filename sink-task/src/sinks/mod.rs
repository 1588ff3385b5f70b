pub mod log;

pub use log::LogSink;
