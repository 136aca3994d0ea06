pub mod anchor;
pub mod calendar;

pub use anchor::{
    bucket_start, closes_bucket, resolve_anchor, AnchorMatch, AnchorOffsets, AnchorResolution,
    AnchorTable,
};
pub use calendar::{BreakConfig, CalendarConfig, CalendarRegistry, MinuteWindow, TradingCalendar};
