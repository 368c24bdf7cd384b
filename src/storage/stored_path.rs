//! Stored-path codec.
//!
//! A stored path is the single string persisted with every resource that says
//! which backend owns the bytes and under which key:
//!
//! - `local@/<key>` for the local filesystem backend
//! - `<platform>:<bucket>@/<key>` for remote object stores
//!
//! Everything here is pure. `StoredPath::encode` is the only way to build a
//! value, so every `StoredPath` in the program carries a normalized key.

use super::{StorageError, StorageResult};
use chrono::{DateTime, Datelike, TimeZone};
use std::{fmt, str::FromStr};

const LOCAL_PREFIX: &str = "local@/";
const KEY_SEPARATOR: &str = "@/";

/// Longest base name (in characters) kept when deriving an object key.
const OBJECT_KEY_BASE_CHARS: usize = 10;

/// Storage platforms a stored path can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Local,
    S3,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Local => "local",
            Platform::S3 => "s3",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = StorageError;

    /// Parse a platform token. `cloudflare` is accepted as an alias for S3
    /// since R2 speaks the same protocol.
    fn from_str(token: &str) -> StorageResult<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Platform::Local),
            "s3" | "cloudflare" => Ok(Platform::S3),
            other => Err(StorageError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Backend-qualified object locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPath {
    platform: Platform,
    bucket: String,
    key: String,
}

impl StoredPath {
    /// Build a locator from its parts, normalizing `key`.
    ///
    /// The bucket is dropped for the local platform.
    pub fn encode(platform: Platform, bucket: &str, key: &str) -> StorageResult<Self> {
        let key = normalize_key(key)?;
        let bucket = match platform {
            Platform::Local => String::new(),
            Platform::S3 => bucket.to_string(),
        };
        Ok(Self {
            platform,
            bucket,
            key,
        })
    }

    /// Parse a persisted locator string.
    pub fn decode(locator: &str) -> StorageResult<Self> {
        if locator.is_empty() {
            return Err(StorageError::PathInvalid("empty stored path".into()));
        }

        if let Some(rest) = locator.strip_prefix(LOCAL_PREFIX) {
            return Self::encode(Platform::Local, "", rest);
        }

        let (prefix, key) = locator
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| StorageError::PathInvalid(format!("missing `@/` in `{locator}`")))?;
        let (token, bucket) = prefix.split_once(':').ok_or_else(|| {
            StorageError::PathInvalid(format!("missing platform separator in `{locator}`"))
        })?;
        let platform = token.parse::<Platform>().map_err(|_| {
            StorageError::PathInvalid(format!("unknown platform `{token}` in `{locator}`"))
        })?;

        Self::encode(platform, bucket, key)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for StoredPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.platform {
            Platform::Local => write!(f, "{}{}", LOCAL_PREFIX, self.key),
            Platform::S3 => write!(
                f,
                "{}:{}{}{}",
                self.platform, self.bucket, KEY_SEPARATOR, self.key
            ),
        }
    }
}

/// Normalize an object key into a relative, forward-slash path.
///
/// Backslashes become slashes, `.` and `..` segments are resolved lexically
/// and leading slashes are stripped. A key that still mentions `..` after
/// that (it tried to climb above its root) is rejected, as is an empty key.
pub fn normalize_key(key: &str) -> StorageResult<String> {
    let unified = key.replace('\\', "/");
    let rooted = unified.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // `/..` is `/`, a relative `..` survives and is rejected below
                _ if rooted => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let clean = segments.join("/");
    if clean.contains("..") {
        return Err(StorageError::PathInvalid(format!(
            "object key `{key}` escapes its root"
        )));
    }
    if clean.is_empty() {
        return Err(StorageError::PathInvalid("empty object key".into()));
    }
    Ok(clean)
}

/// Derive the object key for a new upload: `YYYY-MM/<hash>-<short name>`.
///
/// The base name is cut to ten characters (never splitting a UTF-8 sequence)
/// and keeps its extension; an empty base becomes `file`.
pub fn build_object_key<Tz: TimeZone>(hash: &str, filename: &str, now: DateTime<Tz>) -> String {
    let (base, ext) = match filename.rfind('.') {
        Some(dot) => filename.split_at(dot),
        None => (filename, ""),
    };
    let base = if base.trim().is_empty() { "file" } else { base };
    let short_base: String = base.chars().take(OBJECT_KEY_BASE_CHARS).collect();

    let mut name = format!("{hash}-{short_base}{ext}");
    if name.contains("..") {
        // runs of dots would read as traversal to `normalize_key`
        name = name
            .split('.')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".");
    }
    format!("{}-{:02}/{}", now.year(), now.month(), name)
}

/// Guess a MIME type from the file extension.
pub fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn local_round_trip_drops_bucket() {
        let path = StoredPath::encode(Platform::Local, "ignored", "2025-01/abc-photo.png").unwrap();
        assert_eq!(path.to_string(), "local@/2025-01/abc-photo.png");

        let decoded = StoredPath::decode(&path.to_string()).unwrap();
        assert_eq!(decoded, path);
        assert_eq!(decoded.bucket(), "");
    }

    #[test]
    fn remote_round_trip_keeps_bucket() {
        let path = StoredPath::encode(Platform::S3, "media", "/a/./b/../c.txt").unwrap();
        assert_eq!(path.to_string(), "s3:media@/a/c.txt");

        let decoded = StoredPath::decode("s3:media@/a/c.txt").unwrap();
        assert_eq!(decoded.platform(), Platform::S3);
        assert_eq!(decoded.bucket(), "media");
        assert_eq!(decoded.key(), "a/c.txt");
    }

    #[test]
    fn cloudflare_alias_decodes_as_s3() {
        let decoded = StoredPath::decode("cloudflare:r2@/x/y").unwrap();
        assert_eq!(decoded.platform(), Platform::S3);
        assert_eq!(decoded.to_string(), "s3:r2@/x/y");
    }

    #[test]
    fn normalize_converts_backslashes_and_strips_root() {
        assert_eq!(normalize_key("\\\\dir\\file.bin").unwrap(), "dir/file.bin");
        assert_eq!(normalize_key("//a//b/").unwrap(), "a/b");
        assert_eq!(normalize_key("/../a").unwrap(), "a");
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(matches!(
            normalize_key("../etc/passwd"),
            Err(StorageError::PathInvalid(_))
        ));
        assert!(matches!(
            normalize_key("a/../../b"),
            Err(StorageError::PathInvalid(_))
        ));
        assert!(StoredPath::decode("local@/../secret").is_err());
        assert!(StoredPath::decode("s3:b@/..\\x").is_err());
    }

    #[test]
    fn malformed_locators_are_rejected() {
        for bad in ["", "local", "s3:bucket/key", "bucket@/key", "ftp:b@/key", "local@/"] {
            assert!(
                matches!(StoredPath::decode(bad), Err(StorageError::PathInvalid(_))),
                "expected `{bad}` to be rejected"
            );
        }
    }

    #[test]
    fn object_key_keeps_extension_and_month() {
        let now = Utc.with_ymd_and_hms(2025, 3, 21, 0, 0, 0).unwrap();
        assert_eq!(
            build_object_key("hash", "report.pdf", now),
            "2025-03/hash-report.pdf"
        );
        assert_eq!(build_object_key("hash", ".env", now), "2025-03/hash-file.env");
        assert_eq!(build_object_key("hash", "a..b.txt", now), "2025-03/hash-a.b.txt");
    }

    #[test]
    fn object_key_truncates_by_character() {
        let now = Utc.with_ymd_and_hms(2025, 12, 21, 0, 0, 0).unwrap();
        let key = build_object_key("hash", "这是一个非常非常长的文件名示例.mp4", now);
        let name = key
            .split_once('/')
            .map(|(_, name)| name)
            .and_then(|name| name.strip_prefix("hash-"))
            .unwrap();
        let base = name.strip_suffix(".mp4").unwrap();
        assert_eq!(base.chars().count(), 10);

        let short = build_object_key("hash", "1105-隐身人机.mp4", now);
        assert!(short.ends_with("1105-隐身人机.mp4"));
    }

    #[test]
    fn mime_guess_falls_back_to_octet_stream() {
        assert_eq!(guess_mime("a.png"), "image/png");
        assert_eq!(guess_mime("noext"), "application/octet-stream");
    }
}
