//! WebSocket relay engine
//!
//! A [`Proxy`] takes one validated inbound upgrade, dials the configured
//! backend with the caller's cookies, and once both sides are connected
//! duplexes frames between them until either side closes or fails, or until
//! it is stopped.
//!
//! # Termination
//!
//! - A read or write failure in one direction stops the other direction too.
//! - The failing side's close code is forwarded when it is a real protocol
//!   close; otherwise the peer gets a normal closure with the error text.
//! - A stop sends a normal closure (`Interrupted`) both ways and reports no
//!   error on the terminal error signal.
//!
//! Frames within one direction are forwarded strictly in receive order.

pub mod endpoint;
pub mod frame;
pub mod proxy;
pub mod replicate;

pub use endpoint::{Endpoint, FrameSink, FrameSource};
pub use frame::{CloseFrame, Frame, FrameError};
pub use proxy::{FailureResponse, Handshake, Proxy, ProxyError};
pub use replicate::{relay_loop, replicate, Direction, RelayError};
