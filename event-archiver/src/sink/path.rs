use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Location of a written object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    bucket: String,
    key: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Builds `{prefix/}{YYYY-MM-DD}/{uuid-v7}.parquet` keys, one per flush.
#[derive(Debug, Clone)]
pub struct ObjectKeyTemplate {
    prefix: Option<String>,
}

impl ObjectKeyTemplate {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
        }
    }

    pub fn key_for(&self, written_at: DateTime<Utc>) -> String {
        let date = written_at.format("%Y-%m-%d");
        let id = Uuid::now_v7();
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{date}/{id}.parquet"),
            None => format!("{date}/{id}.parquet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn written_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 59).unwrap()
    }

    #[test]
    fn test_key_without_prefix() {
        let key = ObjectKeyTemplate::new("").key_for(written_at());

        let (date, file) = key.split_once('/').unwrap();
        assert_eq!(date, "2024-03-07");
        let id = file.strip_suffix(".parquet").unwrap();
        assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 7);
    }

    #[test]
    fn test_key_with_prefix() {
        let key = ObjectKeyTemplate::new("/archive/events/").key_for(written_at());
        assert!(key.starts_with("archive/events/2024-03-07/"));
        assert!(key.ends_with(".parquet"));
    }

    #[test]
    fn test_keys_are_unique() {
        let template = ObjectKeyTemplate::new("archive");
        let first = template.key_for(written_at());
        let second = template.key_for(written_at());
        assert_ne!(first, second);
    }

    #[test]
    fn test_display() {
        let path = ObjectPath::new("bucket", "2024-03-07/a.parquet");
        assert_eq!(path.to_string(), "s3://bucket/2024-03-07/a.parquet");
    }
}
