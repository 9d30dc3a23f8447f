//! Persisted meta-graph stories: the in-memory shape, its relational mapping, the topic-space
//! consistency check and (with the `service` feature) the transactional store.

pub mod consistency;
pub mod convert;
pub mod model;
#[cfg(feature = "service")]
pub mod store;

pub use consistency::{check_consistency, StoryConsistency};
pub use convert::{convert_from_database, convert_to_database};
pub use model::{
    MetaGraphStoryData, NarrativeFlowEntry, RichTextDocument, RichTextNode, SegmentLinks,
    StoryContent, StoryHistoryEntry, StoryRecord,
};
#[cfg(feature = "service")]
pub use store::StoryView;
