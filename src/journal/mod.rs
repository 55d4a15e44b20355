pub mod row;
pub mod tailer;
pub mod writer;

pub use tailer::JournalTailer;
pub use writer::Journal;
