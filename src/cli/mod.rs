//! Command implementations for the `opcpool` binary
//!
//! ```bash
//! # Open the configured minimum of connections and print metrics
//! opcpool --config pool.yaml warm
//!
//! # Connect to one endpoint
//! opcpool connect opc.tcp://plc-1.factory.local:4840 --json
//!
//! # Report pool activity until Ctrl-C
//! opcpool watch --interval 10
//! ```

pub mod commands;

pub use commands::{cmd_connect, cmd_warm, cmd_watch, OutputFormat};
