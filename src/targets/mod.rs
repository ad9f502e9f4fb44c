//! Delivery targets: one implementation per backend variant.

mod imap;
mod jsonmail;
mod maildir;
mod pipe;
mod restinbox;
mod traits;

pub use imap::{ImapAuthConfig, ImapTarget, ImapTargetConfig, DEFAULT_CLIENT_ID};
pub use jsonmail::{JsonMailConfig, JsonMailTarget};
pub use maildir::MaildirTarget;
pub use pipe::PipeTarget;
pub use restinbox::{RestInboxConfig, RestInboxCredentials, RestInboxTarget};
pub use traits::{Label, Result, Target, TargetError, TargetKind};
