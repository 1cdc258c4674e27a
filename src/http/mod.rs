//! Admin HTTP listener.
//!
//! Serves the operational endpoints of the router; no user traffic goes
//! through it.

pub mod handler;
