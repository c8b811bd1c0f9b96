//! Object layout: the mark word, the class prototype and the object header.

pub mod klass;
pub mod mark_word;
pub mod object;

pub use klass::Klass;
pub use mark_word::{MarkKind, MarkWord};
pub use object::{ObjectHeader, ObjectRef};
