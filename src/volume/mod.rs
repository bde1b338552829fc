//! Two-tier document storage
//!
//! Freshly fetched documents are written as loose files fanned out by
//! `id mod 1000`. The compressor later packs them into zip volumes and the
//! purge module removes them again. [`VolumeHolder`] hides which tier a
//! document currently lives in.

mod compress;
mod holder;
mod layout;
mod purge;

pub use compress::{Compressor, VolumeStats};
pub use holder::{sniff_content_type, VolumeHolder};
pub use layout::{member_name, parse_member_name, Layout, Part};
pub use purge::{purge_urls, shrink_pending, shrink_volume, PurgeStats, ShrinkOutcome};
