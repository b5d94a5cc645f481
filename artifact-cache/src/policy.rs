//! Freshness decisions for cached entries.
//!
//! Origins in the wild are sloppy about expiry metadata, so the rules here
//! are deliberately simpler and stricter than RFC 7234: explicit expiries
//! are clamped to a plausible horizon, entries without one get a fixed
//! default lifetime, and nothing older than a year is served at all.

use crate::attributes::CacheEntryAttributes;

/// Lifetime granted to entries without a usable expiry: 7 days.
pub const DEFAULT_EXPIRE: u64 = 1000 * 60 * 60 * 24 * 7;

/// Upper bound on origin-supplied expiries, measured from the time the
/// entry was persisted: 28 days.
pub const ORIGIN_EXPIRE_CAP: u64 = 1000 * 60 * 60 * 24 * 28;

/// Entries observed longer ago than this are never served, not even as a
/// stale fallback: 365 days.
pub const ABSOLUTE_EXPIRE: u64 = 1000 * 60 * 60 * 24 * 365;

/// What may be done with a cached entry at a given instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Serve directly, no network traffic needed.
    Fresh,
    /// Revalidate with a conditional request before serving.
    Stale,
    /// Too old to trust at all; evict.
    Unusable,
}

/// Decide what a cached entry is still good for at time `now` (ms epoch).
pub fn freshness(attributes: &CacheEntryAttributes, now: u64) -> Freshness {
    if !within_absolute_limit(attributes, now) {
        return Freshness::Unusable;
    }
    let fresh = if attributes.expiration_time != 0 {
        let effective = attributes.expiration_time.min(
            attributes.create_time.saturating_add(ORIGIN_EXPIRE_CAP),
        );
        now <= effective
    } else if attributes.last_modification > 0 {
        now.saturating_sub(attributes.last_modification) <= DEFAULT_EXPIRE
    } else {
        now.saturating_sub(attributes.create_time) <= DEFAULT_EXPIRE
    };
    if fresh {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

/// `true` while the entry is younger than [`ABSOLUTE_EXPIRE`] and may still
/// be served, fresh or stale.
pub fn within_absolute_limit(
    attributes: &CacheEntryAttributes,
    now: u64,
) -> bool {
    now.saturating_sub(attributes.last_modification) <= ABSOLUTE_EXPIRE
}
