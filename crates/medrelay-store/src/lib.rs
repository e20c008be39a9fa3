pub mod error;
pub mod event_log;

pub use error::StoreError;
pub use event_log::EventLog;
