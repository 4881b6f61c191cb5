pub mod admin;
pub mod health;
pub mod rollups;
pub mod stats;
