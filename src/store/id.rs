//! Document identifiers.
//!
//! A document is keyed by the SHA-256 of its canonical locator, hex encoded.
//! The identifier depends only on the locator and the store's `IdOptions`,
//! so adding the same page twice always lands on the same row.

use sha2::{Digest, Sha256};
use url::Url;

use crate::config::IdOptions;
use crate::error_handling::Error;

/// Canonical form of `locator` under `options`.
///
/// The locator is parsed as a URL (which lowercases the host and drops
/// default ports). `https` is folded to `http` when requested, and query and
/// fragment are removed unless the query string takes part in the identity.
pub fn canonical_locator(locator: &str, options: IdOptions) -> Result<String, Error> {
    let mut url = Url::parse(locator.trim()).map_err(|source| Error::InvalidLocator {
        locator: locator.to_string(),
        source,
    })?;

    if options.fold_secure_scheme && url.scheme() == "https" {
        // http and https are both special schemes, so this cannot fail.
        let _ = url.set_scheme("http");
    }
    if !options.include_query_string {
        url.set_query(None);
        url.set_fragment(None);
    }
    Ok(url.to_string())
}

/// Derives the row identifier for `locator`.
pub fn document_id(locator: &str, options: IdOptions) -> Result<String, Error> {
    let canonical = canonical_locator(locator, options)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}
