pub mod events;
pub mod filters;
pub mod message_builder;
