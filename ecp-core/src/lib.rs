//! Core types and utilities for the External Control Protocol (ECP) client
//!
//! This crate provides the fundamental types shared by every layer of the
//! client: error handling, parameter addressing and the command model.

pub mod address;
pub mod command;
pub mod error;

pub use address::ParameterAddress;
pub use command::{Command, CommandKind, CorrelationKey};
pub use error::{EcpError, EcpResult, ErrorKind};
