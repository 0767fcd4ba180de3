pub mod source;
pub mod telegram;

pub use source::{GroupHandle, MessageSource, RemoteMessage, ResolveError, SourceError};
pub use telegram::TelegramSession;
