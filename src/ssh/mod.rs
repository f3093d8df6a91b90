//! SSH transport and file transfer - connection lifecycle, remote
//! command execution, and the three upload algorithms

mod client;
mod transfer;

pub(crate) use client::stderr_tail;
pub use client::SshClient;
pub use transfer::{
    archive_temp_path, build_archive, file_sha256, sha256_hex, SyncOutcome, SyncStats,
};
