pub mod command;

pub use command::CommandStage;
