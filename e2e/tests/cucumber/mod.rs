pub mod setup;
pub mod steps;
pub mod world;

pub use world::AgoraWorld;
