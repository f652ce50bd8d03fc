pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod llm;
pub mod pacer;
pub mod protocol;
pub mod sandbox;
pub mod scope;
pub mod telemetry;
pub mod tools;
