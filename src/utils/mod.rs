pub mod digest;
pub mod sync;

pub use digest::{bar_digest, content_digest};
