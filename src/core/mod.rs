pub mod engines;
pub mod events;
pub mod locks;
pub mod pipeline;
pub mod state;
pub mod store;
