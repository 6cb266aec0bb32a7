pub mod announcements;
pub mod ask;
pub mod auth;
pub mod session;
pub mod user;

pub use session::{AdminSession, CurrentSession};
