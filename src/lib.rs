//! # certforge
//!
//! Self-hosted certificate authority with an embedded ACME issuance server.
//!
//! ## Features
//!
//! - Root and intermediate CA lifecycle with cascading deletes
//! - RSA and ECDSA leaf issuance, revocation, renewal
//! - ACME (RFC 8555 subset) over HTTP with HTTP-01 challenges
//! - Background challenge validator and manual accept override
//! - Read-only summary feed for dashboards (JSON + SSE)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Dashboard / ACME clients                │
//! ├──────────────────────────────────────────────────────────┤
//! │                 HTTP router (hyper, table)               │
//! │  ┌─────────┐  ┌────────┐  ┌────────────┐  ┌──────────┐  │
//! │  │   CA    │  │  Leaf  │  │    ACME    │  │ Summary  │  │
//! │  │Registry │──│ Issuer │──│   Server   │──│   View   │  │
//! │  └─────────┘  └────────┘  └────────────┘  └──────────┘  │
//! │  ┌─────────────────┐  ┌──────────────────────────────┐  │
//! │  │  PKI codec      │  │  Store (SQLite) + key files  │  │
//! │  └─────────────────┘  └──────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod acme;
pub mod error;
pub mod issuer;
pub mod models;
pub mod paths;
pub mod pki;
pub mod registry;
pub mod server;
pub mod storage;
pub mod summary;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
