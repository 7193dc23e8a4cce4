#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portway-proto
//!
//! Wire protocol shared by the portway relay server and the portway agent.
//!
//! Everything that crosses the relay WebSocket lives here:
//!
//! - [`frames`] — length-prefixed framing and JSON envelope read/write over
//!   any byte stream, plus streaming adapters that tunnel a byte stream as a
//!   sequence of frames terminated by an empty frame.
//! - [`messages`] — the control, HTTP and UDP envelopes exchanged between
//!   server and agent.
//! - [`ws`] — adapter exposing a WebSocket as a plain byte stream so the
//!   multiplexer can run over it.
//! - [`mux`] — yamux session wrapper: one driver task per connection, cheap
//!   clonable handles for opening sub-streams, a receiver for inbound ones.

pub mod frames;
pub mod messages;
pub mod mux;
pub mod ws;
