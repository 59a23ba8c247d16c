use serde::{Deserialize, Serialize};

/// Delivery state of a file as persisted in the file log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Verified,
    Corrupt,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Uploaded => "UPLOADED",
            UploadStatus::Verified => "VERIFIED",
            UploadStatus::Corrupt => "CORRUPT",
            UploadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(UploadStatus::Pending),
            "UPLOADED" => Some(UploadStatus::Uploaded),
            "VERIFIED" => Some(UploadStatus::Verified),
            "CORRUPT" => Some(UploadStatus::Corrupt),
            "FAILED" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status means the bytes reached the server.
    pub fn is_delivered(&self) -> bool {
        matches!(self, UploadStatus::Uploaded | UploadStatus::Verified)
    }
}

/// Read-side view of a file-log row. A missing row reads as the default
/// value (no status, zero mod time, empty hash, zero errors).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileRecord {
    pub status: Option<UploadStatus>,
    pub mod_time: i64,
    pub file_hash: String,
    pub error_count: i64,
}

impl FileRecord {
    /// True when this exact byte-epoch has already been delivered: the
    /// recorded status is a delivered one and the recorded mod time equals
    /// the current on-disk mod time.
    pub fn is_delivered_at(&self, mod_ns: i64) -> bool {
        self.status.map_or(false, |s| s.is_delivered()) && self.mod_time == mod_ns
    }
}

#[cfg(test)]
mod tests {
    use super::{FileRecord, UploadStatus};

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Uploaded,
            UploadStatus::Verified,
            UploadStatus::Corrupt,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UploadStatus::parse("SOMETHING_ELSE"), None);
    }

    #[test]
    fn delivered_requires_matching_mod_time() {
        let rec = FileRecord {
            status: Some(UploadStatus::Verified),
            mod_time: 42,
            file_hash: "abc".to_string(),
            error_count: 0,
        };
        assert!(rec.is_delivered_at(42));
        assert!(!rec.is_delivered_at(43));

        let failed = FileRecord {
            status: Some(UploadStatus::Failed),
            ..FileRecord::default()
        };
        assert!(!failed.is_delivered_at(0));
        assert!(!FileRecord::default().is_delivered_at(0));
    }
}
