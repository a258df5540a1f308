use url::Url;

use crate::{Error, Result};

/// Resolve `specifier` against `base` and strip the fragment, producing the
/// cache key for a module. Without a base the specifier must be absolute.
///
/// # Errors
/// Returns [`Error::InvalidUrl`] if the result is not a valid absolute URL.
pub fn resolve(specifier: &str, base: Option<&Url>) -> Result<Url> {
    let mut url = match base {
        Some(base) => base.join(specifier),
        None => Url::parse(specifier),
    }
    .map_err(|e| Error::invalid_url(specifier, e))?;
    url.set_fragment(None);
    Ok(url)
}
