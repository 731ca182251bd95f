//! Switchyard Core Types and Traits
//!
//! This crate provides the fundamental types shared by every Switchyard crate:
//! - The route command language (`route add/del/weight`) and its parser
//! - Target destinations, schemes and per-target options
//! - The registry backend trait that feeds programs into the router
//! - Core error types

pub mod command;
pub mod error;
pub mod registry;
pub mod target;

pub use command::{Command, HostPath, RouteAdd, RouteDel, RouteWeight, parse_program};
pub use error::{Error, ParseError, ParseErrors, Result};
pub use registry::{ManualEntry, ProgramStream, Registry};
pub use target::{RedirectOption, Scheme, TargetOptions, target_key};
