//! net-transfer
//!
//! File transfer between two peers over a mutually authenticated TLS
//! stream.
//!
//! ## Features
//! - Line-delimited session protocol: listing, selection, upload approval
//! - Exact-length bulk transfers verified with SHA-256
//! - Mutual TLS with loaded or ephemeral certificates
//! - Directory-backed file catalog
//! - Progress bars for transfers
//!
//! ## Usage
//!
//! ```bash
//! # Generate certificates
//! ntx cert generate --output ./certs
//!
//! # Start server, asking the operator about every upload
//! ntx server --cert ./certs/cert.pem --key ./certs/key.pem --storage ./files
//!
//! # Interactive client
//! ntx shell --ca ./certs/cert.pem
//!
//! # One-off commands
//! ntx list --ca ./certs/cert.pem
//! ntx download --ca ./certs/cert.pem report.pdf --dir ./downloads
//! ntx upload --ca ./certs/cert.pem ./notes.txt
//! ```

pub mod catalog;
pub mod client;
pub mod prompt;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

pub use catalog::{DirectoryCatalog, FileCatalog, FileDescriptor};
pub use client::{Client, ClientConfig, ClientSession};
pub use protocol::{Digest, FramedChannel, TransferError};
pub use server::{ApprovalPolicy, Server, ServerConfig};
pub use session::{serve_session, SessionOptions, SessionReport};
pub use tls::{ClientIdentity, ClientTlsConfig, ServerTlsConfig};
