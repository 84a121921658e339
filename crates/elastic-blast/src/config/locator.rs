use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

const AZURE_BLOB_SUFFIX: &str = ".blob.core.windows.net";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    Local,
    Gcs,
    S3,
    AzureBlob,
}

impl StorageScheme {
    pub fn prefix(&self) -> &'static str {
        match self {
            StorageScheme::Local => "",
            StorageScheme::Gcs => "gs://",
            StorageScheme::S3 => "s3://",
            StorageScheme::AzureBlob => "https://",
        }
    }
}

/// Location of an object or an object prefix in local or cloud storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    scheme: StorageScheme,
    /// Full URI (or path) without a trailing slash.
    uri: String,
}

impl Locator {
    pub fn scheme(&self) -> StorageScheme {
        self.scheme
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        match self.scheme {
            StorageScheme::Local => Some(PathBuf::from(&self.uri)),
            _ => None,
        }
    }

    /// Appends a relative path segment.
    pub fn join(&self, segment: &str) -> Locator {
        let segment = segment.trim_matches('/');
        Locator {
            scheme: self.scheme,
            uri: format!("{}/{}", self.uri, segment),
        }
    }

    /// Final path component, used as a short label (e.g. the database name).
    pub fn file_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }

    /// Azure storage account and container of a blob locator.
    pub fn azure_account_container(&self) -> Option<(&str, &str)> {
        if self.scheme != StorageScheme::AzureBlob {
            return None;
        }
        let rest = self.uri.strip_prefix("https://")?;
        let (host, path) = rest.split_once('/')?;
        let account = host.strip_suffix(AZURE_BLOB_SUFFIX)?;
        let container = path.split('/').next()?;
        Some((account, container))
    }
}

impl Display for Locator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri)
    }
}

fn parse_bucket_uri(scheme: StorageScheme, rest: &str, uri: &str) -> anyhow::Result<Locator> {
    let bucket = rest.split('/').next().unwrap_or_default();
    if bucket.is_empty() {
        anyhow::bail!("missing bucket name in `{uri}`");
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!("invalid bucket name `{bucket}`");
    }
    Ok(Locator {
        scheme,
        uri: uri.trim_end_matches('/').to_string(),
    })
}

impl FromStr for Locator {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            anyhow::bail!("empty location");
        }
        if let Some(rest) = value.strip_prefix("gs://") {
            return parse_bucket_uri(StorageScheme::Gcs, rest, value);
        }
        if let Some(rest) = value.strip_prefix("s3://") {
            return parse_bucket_uri(StorageScheme::S3, rest, value);
        }
        if let Some(rest) = value.strip_prefix("https://") {
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            let account = host.strip_suffix(AZURE_BLOB_SUFFIX).ok_or_else(|| {
                anyhow::anyhow!("`{value}` is not an Azure blob storage URL (<account>{AZURE_BLOB_SUFFIX})")
            })?;
            let container = path.split('/').next().unwrap_or_default();
            if account.is_empty() || container.is_empty() {
                anyhow::bail!("`{value}` must name a storage account and a container");
            }
            return Ok(Locator {
                scheme: StorageScheme::AzureBlob,
                uri: value.trim_end_matches('/').to_string(),
            });
        }
        if let Some((scheme, _)) = value.split_once("://") {
            anyhow::bail!("unsupported storage scheme `{scheme}://`");
        }
        let trimmed = value.trim_end_matches('/');
        Ok(Locator {
            scheme: StorageScheme::Local,
            uri: if trimmed.is_empty() { "/" } else { trimmed }.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Locator, StorageScheme};

    #[test]
    fn test_parse_cloud_locators() {
        let gs: Locator = "gs://bucket/results/".parse().unwrap();
        assert_eq!(gs.scheme(), StorageScheme::Gcs);
        assert_eq!(gs.as_str(), "gs://bucket/results");

        let s3: Locator = "s3://my-bucket".parse().unwrap();
        assert_eq!(s3.scheme(), StorageScheme::S3);

        let azure: Locator = "https://acct.blob.core.windows.net/results/run"
            .parse()
            .unwrap();
        assert_eq!(azure.scheme(), StorageScheme::AzureBlob);
        assert_eq!(azure.azure_account_container(), Some(("acct", "results")));
    }

    #[test]
    fn test_parse_invalid_locators() {
        assert!("gs://".parse::<Locator>().is_err());
        assert!("gs://Upper/x".parse::<Locator>().is_err());
        assert!("ftp://host/file".parse::<Locator>().is_err());
        assert!("https://example.com/x".parse::<Locator>().is_err());
        assert!("https://acct.blob.core.windows.net".parse::<Locator>().is_err());
        assert!("".parse::<Locator>().is_err());
    }

    #[test]
    fn test_local_and_join() {
        let local: Locator = "/data/queries.fa".parse().unwrap();
        assert_eq!(local.scheme(), StorageScheme::Local);
        assert_eq!(local.file_name(), "queries.fa");

        let joined = "gs://bucket/out".parse::<Locator>().unwrap().join("/abc/query_batches/");
        assert_eq!(joined.as_str(), "gs://bucket/out/abc/query_batches");
    }
}
