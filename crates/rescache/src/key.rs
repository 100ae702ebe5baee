//! Resource keys and their derivation from user supplied specifiers.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

/// URL schemes that [`KeyResolver`] accepts.
const SUPPORTED_SCHEMES: &[&str] = &["file", "http", "https"];

/// An opaque identifier for a cacheable resource.
///
/// Keys are cheap to clone and are compared by their canonical string form. They are usually
/// produced by a [`KeyResolver`], but any string can serve as a key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the key as URL, which is how the download loaders interpret it.
    pub fn to_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.0)
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({:?})", &*self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<Url> for ResourceKey {
    fn from(url: Url) -> Self {
        Self::from(String::from(url))
    }
}

/// A specifier could not be turned into a [`ResourceKey`].
///
/// This is reported before the cache is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKeyError {
    #[error("empty resource specifier")]
    Empty,
    #[error("malformed resource specifier `{specifier}`: {reason}")]
    Malformed { specifier: String, reason: String },
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
}

/// Resolves specifiers into canonical [`ResourceKey`]s.
///
/// Absolute URLs are normalized, relative specifiers are joined onto the base URL.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    base: Option<Url>,
}

impl KeyResolver {
    pub fn new(base: Option<Url>) -> Self {
        Self { base }
    }

    /// A resolver that resolves relative specifiers against the given directory.
    pub fn with_base_dir(dir: &std::path::Path) -> Result<Self, InvalidKeyError> {
        let base = Url::from_directory_path(dir).map_err(|_| InvalidKeyError::Malformed {
            specifier: dir.display().to_string(),
            reason: "not an absolute directory path".into(),
        })?;
        Ok(Self::new(Some(base)))
    }

    pub fn resolve(&self, specifier: &str) -> Result<ResourceKey, InvalidKeyError> {
        let specifier = specifier.trim();
        if specifier.is_empty() {
            return Err(InvalidKeyError::Empty);
        }

        let malformed = |reason: String| InvalidKeyError::Malformed {
            specifier: specifier.to_owned(),
            reason,
        };

        let url = match Url::parse(specifier) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match self.base {
                Some(ref base) => base.join(specifier).map_err(|e| malformed(e.to_string()))?,
                None => return Err(malformed("relative specifier without base".into())),
            },
            Err(e) => return Err(malformed(e.to_string())),
        };

        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(InvalidKeyError::UnsupportedScheme(url.scheme().to_owned()));
        }

        Ok(ResourceKey::from(url))
    }
}
