pub mod types;
pub mod logger;
pub mod settings;
pub mod sleep;
pub mod platform;
pub mod channel;
pub mod frame;
pub mod matcher;
pub mod interrupt;
pub mod session;
pub mod poller;
pub mod recovery;
pub mod identify;
pub mod quest;
pub mod motion;
pub mod chest;
pub mod combat;
pub mod navigator;
pub mod dungeon;
pub mod farm;
pub mod orchestrator;
