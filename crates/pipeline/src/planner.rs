use crate::{
    destination::DestinationStore,
    models::{ArtifactRecord, TransferUnit},
};
use tracing::warn;

/// Projects source records into destination coordinates and decides whether
/// they have to be sent.
#[derive(Debug, Clone)]
pub struct MigrationPlanner {
    source_root: String,
}

impl MigrationPlanner {
    pub fn new(source_root: &str) -> Self {
        Self {
            source_root: source_root.trim_matches('/').to_owned(),
        }
    }

    /// Strips the source root from the record's path and appends the file
    /// name. Only whole leading segments are stripped: with root `root`,
    /// `root/a` becomes `a` but `rootless/a` is left untouched.
    pub fn normalize(&self, record: ArtifactRecord) -> TransferUnit {
        let relative = match strip_root(&self.source_root, &record.source_path) {
            Some(relative) => relative,
            None => {
                warn!(
                    path = %record.source_path,
                    root = %self.source_root,
                    "record outside source root, keeping its path"
                );
                record.source_path.as_str()
            }
        };

        let destination_path = if relative.is_empty() {
            record.name.clone()
        } else {
            format!("{relative}/{}", record.name)
        };

        TransferUnit {
            destination_path,
            record,
        }
    }

    /// The idempotence gate: a unit is sent when overwriting is forced or the
    /// destination cannot prove it already holds an identical copy.
    pub async fn needs_transfer(
        &self,
        unit: &TransferUnit,
        overwrite: bool,
        destination: &impl DestinationStore,
    ) -> bool {
        overwrite || !destination.exists(unit).await
    }
}

fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let path = path.trim_matches('/');
    if root.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(root)? {
        "" => Some(""),
        rest => rest.strip_prefix('/'),
    }
}
