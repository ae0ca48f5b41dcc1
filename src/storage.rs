//! Local and S3-compatible object storage behind one interface.
//!
//! Remote locations are `s3://bucket/key` URIs served by the endpoint named
//! in `AWS_ENDPOINT_URL`, addressed path-style with anonymous requests.

use crate::error::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::fmt;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Environment variable holding the object store endpoint.
pub const ENDPOINT_ENV: &str = "AWS_ENDPOINT_URL";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl Location {
    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// Child location, `dir/name`.
    pub fn join(&self, name: &str) -> Location {
        match self {
            Location::Local(p) => Location::Local(p.join(name)),
            Location::Remote { bucket, key } => {
                let key = if key.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", key.trim_end_matches('/'), name)
                };
                Location::Remote {
                    bucket: bucket.clone(),
                    key,
                }
            }
        }
    }

    /// Last path component.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()),
            Location::Remote { key, .. } => key
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        }
    }

    /// File name without its final extension.
    pub fn file_stem(&self) -> Option<String> {
        let name = self.file_name()?;
        Some(match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        })
    }

    pub fn has_extension(&self, extension: &str) -> bool {
        let ext = extension.trim_start_matches('.');
        self.file_name()
            .and_then(|n| n.rsplit_once('.').map(|(_, e)| e.to_string()))
            .is_some_and(|e| e.eq_ignore_ascii_case(ext))
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(Error::InvalidParameter {
                        name: "location",
                        value: s.to_string(),
                        reason: "missing bucket name".into(),
                    });
                }
                Ok(Location::Remote {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            None => Ok(Location::Local(PathBuf::from(s))),
        }
    }
}

impl From<&Path> for Location {
    fn from(p: &Path) -> Self {
        Location::Local(p.to_path_buf())
    }
}

impl From<PathBuf> for Location {
    fn from(p: PathBuf) -> Self {
        Location::Local(p)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(p) => write!(f, "{}", p.display()),
            Location::Remote { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// Reads, writes and lists files on the local disk or an S3-compatible store.
#[derive(Debug, Clone, Default)]
pub struct Store {
    endpoint: Option<String>,
    client: Option<Client>,
}

impl Store {
    /// Local disk only.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            endpoint: Some(endpoint.trim_end_matches('/').to_string()),
            client: Some(client),
        })
    }

    /// Remote access when `AWS_ENDPOINT_URL` is set, local only otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ENDPOINT_ENV) {
            Ok(endpoint) if !endpoint.trim().is_empty() => Self::with_endpoint(endpoint.trim()),
            _ => Ok(Self::local()),
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn remote(&self, location: &Location) -> Result<(&Client, &str)> {
        match (&self.client, &self.endpoint) {
            (Some(c), Some(e)) => Ok((c, e.as_str())),
            _ => Err(Error::InvalidParameter {
                name: ENDPOINT_ENV,
                value: location.to_string(),
                reason: "remote location without an object store endpoint".into(),
            }),
        }
    }

    fn object_url(endpoint: &str, bucket: &str, key: &str) -> String {
        format!("{endpoint}/{bucket}/{key}")
    }

    pub fn read_bytes(&self, location: &Location) -> Result<Vec<u8>> {
        match location {
            Location::Local(p) => Ok(fs::read(p)?),
            Location::Remote { bucket, key } => {
                let (client, endpoint) = self.remote(location)?;
                let url = Self::object_url(endpoint, bucket, key);
                debug!("GET {}", url);
                let resp = client.get(&url).send()?;
                if !resp.status().is_success() {
                    return Err(Error::RemoteStatus {
                        status: resp.status().as_u16(),
                        url,
                    });
                }
                Ok(resp.bytes()?.to_vec())
            }
        }
    }

    /// Up to `len` bytes starting at `offset`. Remote reads send a `Range`
    /// header; a server that ignores it has its full response truncated.
    pub fn read_range(&self, location: &Location, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if len == 0 {
            return Ok(out);
        }
        match location {
            Location::Local(p) => {
                let mut file = fs::File::open(p)?;
                file.seek(SeekFrom::Start(offset))?;
                file.take(len).read_to_end(&mut out)?;
            }
            Location::Remote { bucket, key } => {
                let (client, endpoint) = self.remote(location)?;
                let url = Self::object_url(endpoint, bucket, key);
                let range = format!("bytes={}-{}", offset, offset + len - 1);
                debug!("GET {} ({})", url, range);
                let resp = client.get(&url).header(RANGE, range).send()?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(Error::RemoteStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                let body = resp.bytes()?;
                let skip = if status == StatusCode::PARTIAL_CONTENT {
                    0
                } else {
                    (offset as usize).min(body.len())
                };
                let end = skip.saturating_add(len as usize).min(body.len());
                out.extend_from_slice(&body[skip..end]);
            }
        }
        Ok(out)
    }

    pub fn read_to_string(&self, location: &Location) -> Result<String> {
        let bytes = self.read_bytes(location)?;
        String::from_utf8(bytes).map_err(|e| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Write an object, creating local parent directories as needed.
    pub fn write_bytes(&self, location: &Location, data: &[u8]) -> Result<()> {
        match location {
            Location::Local(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::write(p, data)?;
                Ok(())
            }
            Location::Remote { bucket, key } => {
                let (client, endpoint) = self.remote(location)?;
                let url = Self::object_url(endpoint, bucket, key);
                debug!("PUT {} ({} bytes)", url, data.len());
                let resp = client.put(&url).body(data.to_vec()).send()?;
                if !resp.status().is_success() {
                    return Err(Error::RemoteStatus {
                        status: resp.status().as_u16(),
                        url,
                    });
                }
                Ok(())
            }
        }
    }

    /// Files directly under `dir` with the given extension (case-insensitive),
    /// sorted by location.
    pub fn list(&self, dir: &Location, extension: &str) -> Result<Vec<Location>> {
        let mut found = match dir {
            Location::Local(p) => {
                let mut out = Vec::new();
                for entry in fs::read_dir(p)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        out.push(Location::Local(entry.path()));
                    }
                }
                out
            }
            Location::Remote { bucket, key } => {
                let prefix = if key.is_empty() || key.ends_with('/') {
                    key.clone()
                } else {
                    format!("{key}/")
                };
                self.list_remote(dir, bucket, &prefix)?
                    .into_iter()
                    .filter(|k| !k[prefix.len().min(k.len())..].contains('/'))
                    .map(|key| Location::Remote {
                        bucket: bucket.clone(),
                        key,
                    })
                    .collect()
            }
        };
        found.retain(|l| l.has_extension(extension));
        found.sort();
        Ok(found)
    }

    fn list_remote(&self, dir: &Location, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let (client, endpoint) = self.remote(dir)?;
        let url = format!("{endpoint}/{bucket}");
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = client
                .get(&url)
                .query(&[("list-type", "2"), ("prefix", prefix), ("delimiter", "/")]);
            if let Some(t) = &token {
                req = req.query(&[("continuation-token", t.as_str())]);
            }
            let resp = req.send()?;
            if !resp.status().is_success() {
                return Err(Error::RemoteStatus {
                    status: resp.status().as_u16(),
                    url,
                });
            }
            let page = parse_list_response(&resp.text()?)?;
            keys.extend(page.keys);
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        debug!("{} objects under s3://{}/{}", keys.len(), bucket, prefix);
        Ok(keys)
    }
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Parse the `<Key>` entries and continuation token of a ListObjectsV2 body.
pub fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut page = ListPage::default();
    let mut truncated = false;
    let mut current: Option<Vec<u8>> = None;
    // Keys nested in <CommonPrefixes> are sub-directories, not objects.
    let mut in_prefixes = false;

    loop {
        match reader.read_event().map_err(|e| Error::Xml(e.to_string()))? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"CommonPrefixes" {
                    in_prefixes = true;
                }
                current = Some(name);
            }
            Event::End(e) => {
                if e.name().as_ref() == b"CommonPrefixes" {
                    in_prefixes = false;
                }
                current = None;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| Error::Xml(e.to_string()))?.into_owned();
                match current.as_deref() {
                    Some(b"Key") if !in_prefixes => page.keys.push(text),
                    Some(b"NextContinuationToken") => page.next_token = Some(text),
                    Some(b"IsTruncated") => truncated = text == "true",
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let l: Location = "s3://bucket/data/interim/tiles".parse().unwrap();
        assert_eq!(
            l,
            Location::Remote {
                bucket: "bucket".into(),
                key: "data/interim/tiles".into()
            }
        );
        assert_eq!(l.join("a.las").to_string(), "s3://bucket/data/interim/tiles/a.las");
        let l: Location = "data/interim".parse().unwrap();
        assert_eq!(l, Location::Local(PathBuf::from("data/interim")));
        assert!("s3:///key".parse::<Location>().is_err());
    }

    #[test]
    fn test_file_name_and_extension() {
        let l: Location = "s3://b/tiles/SU_1234_5.LAS".parse().unwrap();
        assert_eq!(l.file_name().as_deref(), Some("SU_1234_5.LAS"));
        assert_eq!(l.file_stem().as_deref(), Some("SU_1234_5"));
        assert!(l.has_extension("las"));
        assert!(!l.has_extension("laz"));
    }

    #[test]
    fn test_local_list_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.las", "a.las", "b.txt", "B.LAS"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.las")).unwrap();
        let store = Store::local();
        let found = store.list(&Location::from(dir.path()), "las").unwrap();
        let names: Vec<String> = found.iter().filter_map(Location::file_name).collect();
        assert_eq!(names, vec!["B.LAS", "a.las", "c.las"]);
    }

    #[test]
    fn test_local_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::from(dir.path().join("x/y/z.csv"));
        let store = Store::local();
        store.write_bytes(&loc, b"id\n1\n").unwrap();
        assert_eq!(store.read_to_string(&loc).unwrap(), "id\n1\n");
    }

    #[test]
    fn test_local_read_range() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::from(dir.path().join("tile.las"));
        let store = Store::local();
        store.write_bytes(&loc, b"LASF0123456789").unwrap();
        assert_eq!(store.read_range(&loc, 0, 4).unwrap(), b"LASF");
        assert_eq!(store.read_range(&loc, 10, 100).unwrap(), b"6789");
        assert!(store.read_range(&loc, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_remote_without_endpoint_is_error() {
        let store = Store::local();
        let loc: Location = "s3://b/k.tif".parse().unwrap();
        assert!(matches!(store.read_bytes(&loc), Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn test_parse_list_response() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>tiles/</Prefix>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>tiles/b_2.las</Key><Size>10</Size></Contents>
  <Contents><Key>tiles/a_1.las</Key><Size>12</Size></Contents>
  <CommonPrefixes><Prefix>tiles/old/</Prefix></CommonPrefixes>
  <NextContinuationToken>abc=</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_response(xml).unwrap();
        assert_eq!(page.keys, vec!["tiles/b_2.las", "tiles/a_1.las"]);
        assert_eq!(page.next_token.as_deref(), Some("abc="));
    }

    #[test]
    fn test_parse_list_last_page() {
        let xml = "<ListBucketResult><IsTruncated>false</IsTruncated>\
                   <Contents><Key>k.las</Key></Contents></ListBucketResult>";
        let page = parse_list_response(xml).unwrap();
        assert_eq!(page.keys, vec!["k.las"]);
        assert!(page.next_token.is_none());
    }
}
