pub mod session;
pub mod session_options;

pub use session::{DbSession, SessionPurpose};
pub use session_options::SessionOptions;
