pub mod classify;
pub mod walk;

pub use classify::{classify, EntryClass};
pub use walk::{list_candidates, Candidate};
