//! # Commands Module
//!
//! The operations behind the `beam` subcommands:
//!
//! ## `send`
//! Sends a file or directory:
//! - Describes the source and resolves receivers (static or discovered)
//! - Runs the sender pipeline: one source reader, one encoder per stream,
//!   one writer per (receiver, stream)
//!
//! ## `fanout`
//! Coordinates the handshakes and pipelines of every receiver of one send:
//! - Handshakes run concurrently
//! - First-verified-wins unless fan-out is enabled
//! - Failures are isolated per receiver and reported as outcomes
//!
//! ## `receive`
//! Serves incoming transfers:
//! - Answers discovery queries
//! - Verifies keys locally and accepts or rejects offers
//! - Reassembles streams into a staged destination and moves it into place

pub mod fanout;
pub mod receive;
pub mod send;
