pub mod change_feed;
pub mod types;

pub use change_feed::{ChangeFeed, FeedGap, FeedRead};
pub use types::{ChangeEvent, ChangeKind};
