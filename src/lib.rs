//! llmlink keeps an LLM chat session connected across unreliable backends.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`broker`] owns connection state: candidate selection, retry with
//!   exponential backoff, failure classification, stream reassembly, and
//!   status fan-out.
//! - [`transport`] implements the interchangeable backend candidates (local
//!   service, cloud relay, public tunnel) behind one trait.
//! - [`api`] defines the chat and streaming wire payloads shared by every
//!   transport.
//! - [`core`] holds configuration loading and persistence.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`), which
//! builds a [`broker::ConnectionBroker`] from configuration and drives one
//! chat exchange through it.

pub mod api;
pub mod broker;
pub mod core;
pub mod transport;
