pub mod lookup;
pub mod time;
pub mod types;
