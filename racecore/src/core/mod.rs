pub mod agent;
pub mod events;
pub mod handle_race;
pub mod physics;
pub mod race;
pub mod state_handler;
pub mod strategy;
pub mod tireset;
pub mod track;
pub mod vehicle;
pub mod weather;
