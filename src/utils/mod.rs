pub mod hash;
pub mod time;
