pub mod fixtures;
pub mod network;
pub mod prepare_env;
