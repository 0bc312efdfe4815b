pub mod attendance;
pub mod catalog;
pub mod core;
pub mod enrollments;
pub mod payments;
pub mod permissions;
pub mod setup;
