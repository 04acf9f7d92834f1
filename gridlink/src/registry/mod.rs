//! # Peer Registry
//!
//! Registries map node identities to the endpoints those nodes accept peer
//! connections on. A node may be configured with several registries; they
//! are merged into one [`RegistryDirectory`] with first-seen-wins
//! semantics across the configured order.
//!
//! ```text
//! source.rs    - RegistrySource {File, Http}: parse + fetch one document
//! document.rs  - YAML node entry format and validation
//! directory.rs - deterministic first-seen-wins merge
//! resolver.rs  - concurrent fetch, retry, snapshot publication
//! ```

pub mod directory;
pub mod document;
pub mod error;
pub mod resolver;
pub mod source;

pub use directory::{DirectoryEntry, RegistryDirectory};
pub use document::{parse_document, RegistryNode};
pub use error::RegistryError;
pub use resolver::{RegistryResolver, RegistrySnapshot, SourceReport, SourceStatus};
pub use source::{RegistrySource, SourceKind};
