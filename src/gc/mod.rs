//! Collector-side uses of the mark word.

pub mod forwarding;
pub mod preserved_marks;

pub use forwarding::{forward_to, get_forwardee, is_forwarded, try_forward_preserving, try_update_forwardee};
pub use preserved_marks::{PreservedMark, PreservedMarks, PreservedMarksSet};
