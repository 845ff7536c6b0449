pub mod events;
pub mod owner;
pub mod public;
pub mod staff;
