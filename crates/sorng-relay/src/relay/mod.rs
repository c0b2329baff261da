// ── sorng-relay / relay module ────────────────────────────────────────────────
//
// Copies one file from a source SFTP endpoint to a target SFTP endpoint
// without touching local disk:
//   • Session establishment (key / password auth, host-key policy)
//   • Stream relay over the `RemoteFs` capability
//   • Async orchestration of both sessions with guaranteed release

pub mod cancel;
pub mod error;
pub mod host_keys;
pub mod keys;
pub mod run;
pub mod service;
pub mod session;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CancelToken, Interrupt};
pub use error::{RelayError, RelayErrorKind, RelayResult};
pub use host_keys::HostKeyPolicy;
pub use run::relay;
pub use service::Establisher;
pub use session::{RemoteFs, RemoteWrite, SftpSession};
pub use transfer::{relay_stream, CopyOptions};
pub use types::*;
