pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod ops;
pub mod output;
pub mod proto;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod state;
