//! URL handling module for Ampelopsis
//!
//! This module provides canonicalization of fetched and discovered URLs,
//! host-key extraction used by host whitelisting, and the regex/length
//! filter applied to extracted links.

mod filter;
mod host;
mod normalize;

// Re-export main functions
pub use filter::{FilterVerdict, LinkFilter};
pub use host::{host_key, registrable_domain};
pub use normalize::{normalize_component, normalize_url, resolve_link};
