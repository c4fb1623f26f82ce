use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use blob_db::BlobRecord;

/// Metadata view of a blob as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlobView {
    pub id: String,
    pub path: String,
    pub size: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub sha256: String,
    pub properties: Value,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<BlobRecord> for BlobView {
    fn from(record: BlobRecord) -> Self {
        Self {
            id: record.id.to_string(),
            path: record.path,
            size: record.size,
            sha256: record.sha256,
            properties: record.properties,
            created_by: record.created_by,
            updated_by: record.updated_by,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// Body of a metadata-only update.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateBlobBody {
    pub properties: Value,
}

/// Listing parameters. Signed so that negative values can be rejected with a
/// 400 instead of silently wrapping.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListBlobsQuery {
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub order_by: Option<String>,
}

/// Attributes accompanying a multipart upload, collected from the non-file
/// form fields before the file part is read.
#[derive(Debug, Default)]
pub struct UploadAttributes {
    pub path: String,
    pub size: Option<i64>,
    pub properties: Option<Value>,
}

impl UploadAttributes {
    /// Trims and canonicalizes the declared path: collapses duplicate
    /// slashes and strips a trailing slash (the root alone is left as-is).
    pub fn normalize(&mut self) {
        let trimmed = self.path.trim();
        let mut out = String::with_capacity(trimmed.len());
        let mut prev_slash = false;
        for ch in trimmed.chars() {
            if ch == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            out.push(ch);
        }
        if out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
        self.path = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(path: &str) -> UploadAttributes {
        UploadAttributes {
            path: path.to_string(),
            size: Some(1),
            properties: None,
        }
    }

    #[test]
    fn normalize_collapses_slashes_and_trims() {
        let mut a = attrs("  /docs//2024///report.pdf/ ");
        a.normalize();
        assert_eq!(a.path, "/docs/2024/report.pdf");

        let mut root = attrs("/");
        root.normalize();
        assert_eq!(root.path, "/");
    }

    #[test]
    fn blob_view_serializes_empty_digest_away() {
        let view = BlobView {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            path: "/x".into(),
            size: 0,
            sha256: String::new(),
            properties: json!({}),
            created_by: "u".into(),
            updated_by: "u".into(),
            created_at: "2024-01-01T00:00:00+00:00".into(),
            updated_at: "2024-01-01T00:00:00+00:00".into(),
        };
        let serialized = serde_json::to_value(&view).unwrap();
        assert!(serialized.get("sha256").is_none());
    }
}
