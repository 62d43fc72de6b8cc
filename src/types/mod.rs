pub mod record;
pub mod ticker;
pub mod timestamp;

pub use record::{EntityKey, NormalizedRecord, RawRecord, SourceQuote};
pub use ticker::Ticker;
pub use timestamp::Timestamp;
