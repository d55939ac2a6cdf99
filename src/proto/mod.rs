//! Protocol types for the orchestrator gRPC service.
//!
//! `messages` holds the prost messages; the client and server stubs are generated by `build.rs`.

mod messages;

pub use messages::*;

include!(concat!(env!("OUT_DIR"), "/waystation.v1.Orchestrator.rs"));
