pub mod hosts;
pub mod resources;
pub mod serve;
