pub mod api;
pub mod app;
pub mod conversations;
pub mod error;
pub mod realtime;
pub mod send;
pub mod session;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod view;

#[cfg(test)]
mod testing;

pub use app::AppConfig;
pub use error::{ChatError, ChatResult, ErrorKind};
pub use session::ChatSession;
pub use view::ConversationView;
