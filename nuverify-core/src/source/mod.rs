pub mod github;

use serde::{Deserialize, Serialize};

use crate::version::{Version, VersionRange};

/// Release notes for one interpreter version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogBlock {
    pub version: Version,
    pub text: String,
    /// Where the text came from (blog post or release page), for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Supplies release metadata and change-log text.
#[async_trait::async_trait]
pub trait ChangeLogSource: Send + Sync + std::fmt::Debug {
    /// Newest stable release.
    async fn latest_version(&self) -> crate::error::Result<Version>;

    /// One block per non-patch release inside `range`, oldest first.
    async fn change_log(&self, range: &VersionRange) -> crate::error::Result<Vec<ChangeLogBlock>>;
}
