//! Line relay chat over plain TCP.
//!
//! A server accepts any number of clients and re-sends every line a client
//! writes to all connected clients, the sender included, framed as
//! `MESSAGE <line>`. A small terminal client prints relayed lines and
//! forwards what the user types.
//!
//! - [`cli`] parses the `server` and `client` subcommands.
//! - [`server`] owns the listener and spawns one session task per client.
//! - [`session`] drives a single connection from registration to close.
//! - [`registry`] tracks live sessions and fans lines out to them.
//! - [`client`] is the terminal peer.
//! - [`protocol`] holds the line framing shared by both sides.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
