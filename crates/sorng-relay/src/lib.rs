//! # SortOfRemote NG – Relay
//!
//! Two-endpoint SFTP file relay:
//!   • Private-key loading (OpenSSH, PKCS#1, PKCS#8) with passphrase support
//!   • Explicit per-endpoint host-key policy (pinned, known_hosts, …)
//!   • Concurrent session establishment over `ssh2`
//!   • Chunked streaming from one remote session straight into another
//!   • Cancellation, deadlines & progress reporting

pub mod relay;
