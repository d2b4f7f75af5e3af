pub mod fuser;
pub mod oneshot;
pub mod stage;
