pub mod inbox;
pub mod oneshot;
pub mod ring;
