//! Message send/receive and the real-time feed
//!
//! - **pipeline**: per-conversation send and receive, DM and group
//! - **sync**: applies feed events to conversation views
//! - **dedup**: bounded recently-seen identifier set
//! - **typing**: ephemeral typing indicators

pub mod dedup;
pub mod pipeline;
pub mod sync;
pub mod typing;

pub use dedup::RecentIds;
pub use pipeline::{ConversationState, MessagePipeline};
pub use sync::{Notification, SyncEventProcessor};
pub use typing::TypingTracker;
