pub mod cli;
pub mod config;
pub mod control;
pub mod frames;
pub mod playlist;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod server;
pub mod silence;
pub mod streamer;
pub mod transcoder;
