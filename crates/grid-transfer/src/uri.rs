//! Minimal URL handling for storage URLs.
//!
//! Storage URLs look like `scheme://host[:port]/path`. SRM SURLs may carry a
//! `?SFN=` query naming the site file name. Only the pieces the engine needs
//! are parsed; full generic-URI handling is out of scope.

use crate::error::{Result, TransferError};

/// Parsed pieces of a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    /// Path component, including the leading slash. Empty if absent.
    pub path: String,
    /// Query string after `?`, without the question mark.
    pub query: Option<String>,
}

impl StorageUrl {
    /// Parse `scheme://host[:port][/path][?query]`.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransferError::invalid_argument(format!("not a URL: '{}'", url)))?;
        if scheme.is_empty() {
            return Err(TransferError::invalid_argument(format!(
                "missing scheme: '{}'",
                url
            )));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q.to_string())),
            None => (rest, None),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| {
                    TransferError::invalid_argument(format!("invalid port in '{}'", url))
                })?;
                (h, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(TransferError::invalid_argument(format!(
                "missing host: '{}'",
                url
            )));
        }

        Ok(StorageUrl {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path,
            query,
        })
    }
}

/// Scheme of a URL, if it has one.
pub fn scheme_of(url: &str) -> Option<&str> {
    url.split_once("://").map(|(s, _)| s)
}

/// Hostname (without port) of a URL.
pub fn hostname_of(url: &str) -> Result<String> {
    Ok(StorageUrl::parse(url)?.host)
}

/// Parent URL of `url`, with trailing slashes ignored. Fails with EINVAL
/// when the URL has no parent (the path is the root or empty).
pub fn parent_of(url: &str) -> Result<String> {
    let trimmed = url.trim_end_matches('/');
    let authority_end = trimmed
        .split_once("://")
        .map(|(s, _)| s.len() + 3)
        .unwrap_or(0);
    // The first slash after the authority starts the path; a parent exists
    // only when there is a later one.
    let after = &trimmed[authority_end..];
    match (after.find('/'), after.rfind('/')) {
        (Some(first), Some(last)) if last > first => {
            Ok(trimmed[..authority_end + last].to_string())
        }
        _ => Err(TransferError::invalid_argument(format!(
            "URL has no parent: '{}'",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let u = StorageUrl::parse("gsiftp://storage.example.org:2811/data/file.root").unwrap();
        assert_eq!(u.scheme, "gsiftp");
        assert_eq!(u.host, "storage.example.org");
        assert_eq!(u.port, Some(2811));
        assert_eq!(u.path, "/data/file.root");
        assert!(u.query.is_none());
    }

    #[test]
    fn test_parse_srm_with_sfn() {
        let u = StorageUrl::parse("srm://se.example.org:8446/srm/managerv2?SFN=/data/f").unwrap();
        assert_eq!(u.path, "/srm/managerv2");
        assert_eq!(u.query.as_deref(), Some("SFN=/data/f"));
    }

    #[test]
    fn test_parse_no_port_no_path() {
        let u = StorageUrl::parse("srm://se.example.org").unwrap();
        assert_eq!(u.host, "se.example.org");
        assert_eq!(u.port, None);
        assert_eq!(u.path, "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StorageUrl::parse("/local/path").is_err());
        assert!(StorageUrl::parse("://nohost/x").is_err());
        assert!(StorageUrl::parse("gsiftp://host:notaport/x").is_err());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(
            parent_of("gsiftp://host/data/file").unwrap(),
            "gsiftp://host/data"
        );
        assert_eq!(
            parent_of("gsiftp://host/data/dir/").unwrap(),
            "gsiftp://host/data"
        );
        assert!(parent_of("gsiftp://host/").is_err());
        assert!(parent_of("gsiftp://host/file").is_err());
    }
}
