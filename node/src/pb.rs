//! Generated protocol types shared by the gRPC services and the chain
//! payload encoding.

#![allow(clippy::module_inception)]

tonic::include_proto!("raft");
