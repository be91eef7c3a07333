// ABOUTME: Protobuf message types for the AxonServer platform, command, query, event and admin APIs.
// ABOUTME: Messages are derived by hand with prost; method paths live in the `paths` module.

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod admin;
pub mod command;
pub mod common;
pub mod control;
pub mod event;
pub mod paths;
pub mod query;

// Re-export the shared message types at crate root for convenience
pub use common::{
    meta_data_value, ErrorMessage, FlowControl, InstructionAck, MetaDataValue,
    ProcessingInstruction, ProcessingKey, SerializedObject,
};
