//! Controller request surface
//!
//! The transport is a byte pipe owned elsewhere; it decodes requests into
//! the types here and hands them to [`RequestHandler`]. Action failures are
//! reported inside the result payload, never as transport errors.

mod handler;
mod types;

pub use handler::{HandlerError, RequestHandler};
pub use types::{
    ActionRequest, ActionResult, BridgeRequest, SessionEndRequest, SessionStartRequest,
};
