pub mod announcement;
pub mod user;

pub use announcement::Announcement;
pub use user::{Directory, Role, Status, UserDetail, UserDto, UserRecord};
