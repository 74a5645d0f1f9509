//! toolmesh protocol definitions
//!
//! This crate contains the protobuf message types and the gRPC client/server
//! stubs generated from `proto/toolmesh.proto` at build time, plus the
//! conversion between the wire value model and `serde_json::Value`.

pub mod value;

pub mod v1 {
    #[allow(clippy::all)]
    #[allow(warnings)]
    include!(concat!(env!("OUT_DIR"), "/toolmesh.v1.rs"));
}

pub use v1::tool_service_client::ToolServiceClient;
pub use v1::tool_service_server::{ToolService, ToolServiceServer};
