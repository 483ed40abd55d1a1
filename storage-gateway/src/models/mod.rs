pub mod invite_code;
pub mod stored_object;
pub mod user;

pub use invite_code::InviteCode;
pub use stored_object::{FileEntry, StoredObject};
pub use user::User;
