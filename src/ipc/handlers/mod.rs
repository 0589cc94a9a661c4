pub mod core;
pub mod extensions;
pub mod projects;
pub mod reviews;
pub mod rubric;
pub mod status;
