mod processor;

pub use processor::{HistoryProcessor, RECENT_HISTORY_LIMIT};
