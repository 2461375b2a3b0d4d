pub mod events;
pub mod resume;
