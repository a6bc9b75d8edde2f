//! Upstream OAuth provider metadata (data) and error classification (behavior).
//!
//! `descriptor` holds the validated endpoints, redirect URI, scopes, and quirks that every
//! application shares; per-application client credentials live in the registry.
//! `strategy` defines [`ProviderStrategy`], the hook that maps token endpoint failures into
//! the broker error taxonomy and decorates authorization URLs.

pub mod descriptor;
pub mod strategy;

pub use descriptor::*;
pub use strategy::*;
