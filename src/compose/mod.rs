//! Docker Compose documents
//!
//! Parsing compose YAML into a [`crate::spec::Spec`], rendering a spec
//! back to YAML, and generating production-shaped specs from short
//! service requests.

pub mod document;
pub mod generate;
pub mod parser;
pub mod render;

pub use document::{ComposeDocument, RawService};
pub use generate::{detect_role, Generator, ServiceRequest, ServiceRole, APP_NETWORK};
pub use parser::ComposeParser;
pub use render::{to_document, to_yaml};
