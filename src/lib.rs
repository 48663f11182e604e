#[macro_use]
mod macros;

pub mod config;
pub mod flow;
pub mod handshake;
pub mod keygen;
pub mod kv;
pub mod limiter;
pub mod measure;
pub mod packet;
pub mod parsers;
pub mod port;
pub mod resp;
pub mod run;
pub mod rx;
pub mod schedule;
pub mod time;
pub mod tx;
pub mod wire;
