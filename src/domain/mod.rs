//! Domain types: identifiers, messages, deliveries and delivery records.

mod message;
mod record;
mod types;

pub use message::{DeliveryTrace, Message};
pub use record::{DeliveryRecord, RecordState};
pub use types::{Checkpoint, CommitRef, Delivery, DeliveryId, FeedId, MessageId, TargetId};
