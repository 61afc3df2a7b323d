pub mod comments;
pub mod likes;
pub mod profiles;
