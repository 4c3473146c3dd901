use super::EnvironmentError;
use crate::shared::fs_atomic::atomic_write_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Provider ids are compared on their 15-character case-sensitive prefix;
/// the provider issues both 15- and 18-character forms of the same id.
const PROVIDER_ID_PREFIX_LEN: usize = 15;

/// Locally registered environment credential material. Owned by the
/// lifecycle manager for the duration of one run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnvironmentHandle {
    pub alias: String,
    pub provider_id: String,
    pub principal: String,
    pub instance_url: String,
    pub access_token: String,
    pub scratch: bool,
    pub last_refreshed: DateTime<Utc>,
}

/// File-backed registry of environment handles, one JSON file per alias.
/// Imports never overwrite a handle with mismatched identity fields.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    dir: PathBuf,
}

fn id_prefix(provider_id: &str) -> &str {
    match provider_id.char_indices().nth(PROVIDER_ID_PREFIX_LEN) {
        Some((end, _)) => &provider_id[..end],
        None => provider_id,
    }
}

impl EnvironmentRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn handle_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.json"))
    }

    pub fn get(&self, alias: &str) -> Result<Option<EnvironmentHandle>, EnvironmentError> {
        let path = self.handle_path(alias);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(EnvironmentError::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            }
        };
        let handle = serde_json::from_str(&raw).map_err(|err| EnvironmentError::Json {
            path: path.display().to_string(),
            source: err,
        })?;
        Ok(Some(handle))
    }

    /// Registers `handle` under its alias. If the alias is already taken, the
    /// existing record's identity fields must match exactly; a match refreshes
    /// the stored credential material, a mismatch is fatal and nothing is
    /// written.
    pub fn import(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        if let Some(existing) = self.get(&handle.alias)? {
            if id_prefix(&existing.provider_id) != id_prefix(&handle.provider_id)
                || existing.principal != handle.principal
            {
                return Err(EnvironmentError::Conflict {
                    alias: handle.alias.clone(),
                    registered_provider_id: existing.provider_id,
                    registered_principal: existing.principal,
                    fetched_provider_id: handle.provider_id.clone(),
                    fetched_principal: handle.principal.clone(),
                });
            }
        }
        self.write(handle)
    }

    fn write(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        let path = self.handle_path(&handle.alias);
        let body = serde_json::to_vec_pretty(handle).map_err(|err| EnvironmentError::Json {
            path: path.display().to_string(),
            source: err,
        })?;
        atomic_write_file(&path, &body).map_err(|err| EnvironmentError::Io {
            path: path.display().to_string(),
            source: err,
        })
    }

    /// Removes the local record. Idempotent; returns whether a record existed.
    pub fn remove(&self, alias: &str) -> Result<bool, EnvironmentError> {
        let path = self.handle_path(alias);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(EnvironmentError::Io {
                path: path.display().to_string(),
                source: err,
            }),
        }
    }

    pub fn registered(&self, alias: &str) -> bool {
        self.handle_path(alias).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(alias: &str, provider_id: &str, principal: &str) -> EnvironmentHandle {
        EnvironmentHandle {
            alias: alias.to_string(),
            provider_id: provider_id.to_string(),
            principal: principal.to_string(),
            instance_url: "https://env.example.com".to_string(),
            access_token: "tok".to_string(),
            scratch: false,
            last_refreshed: Utc::now(),
        }
    }

    #[test]
    fn import_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EnvironmentRegistry::new(dir.path());
        let h = handle("jobd-1", "00D000000000001AAA", "worker@example.com");
        registry.import(&h).expect("import");
        let loaded = registry.get("jobd-1").expect("get").expect("present");
        assert_eq!(loaded, h);
        assert!(registry.registered("jobd-1"));
    }

    #[test]
    fn matching_reimport_refreshes_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EnvironmentRegistry::new(dir.path());
        // 15-char prefix matches even when one side carries the 18-char form.
        registry
            .import(&handle("jobd-2", "00D000000000002", "worker@example.com"))
            .expect("import");
        let mut refreshed = handle("jobd-2", "00D000000000002EAC", "worker@example.com");
        refreshed.access_token = "fresh".to_string();
        registry.import(&refreshed).expect("reimport");
        let loaded = registry.get("jobd-2").expect("get").expect("present");
        assert_eq!(loaded.access_token, "fresh");
    }

    #[test]
    fn mismatched_identity_is_a_conflict_and_keeps_the_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EnvironmentRegistry::new(dir.path());
        let original = handle("jobd-3", "00D000000000003AAA", "worker@example.com");
        registry.import(&original).expect("import");

        let intruder = handle("jobd-3", "00D000000000009AAA", "worker@example.com");
        let err = registry.import(&intruder).expect_err("conflict");
        assert!(matches!(err, EnvironmentError::Conflict { .. }));
        let kept = registry.get("jobd-3").expect("get").expect("present");
        assert_eq!(kept.provider_id, original.provider_id);

        let wrong_principal = handle("jobd-3", "00D000000000003AAA", "other@example.com");
        assert!(matches!(
            registry.import(&wrong_principal),
            Err(EnvironmentError::Conflict { .. })
        ));
    }

    #[test]
    fn prefix_comparison_handles_multibyte_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EnvironmentRegistry::new(dir.path());
        // 14 ascii chars then a two-byte char, so the 15-char prefix cut
        // falls inside a multi-byte sequence.
        let odd_id = "00D000000000Caé-extra";
        registry
            .import(&handle("jobd-5", odd_id, "worker@example.com"))
            .expect("import");
        registry
            .import(&handle("jobd-5", odd_id, "worker@example.com"))
            .expect("reimport");
        assert!(matches!(
            registry.import(&handle("jobd-5", "00D000000000Xaé-extra", "worker@example.com")),
            Err(EnvironmentError::Conflict { .. })
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EnvironmentRegistry::new(dir.path());
        registry
            .import(&handle("jobd-4", "00D000000000004AAA", "worker@example.com"))
            .expect("import");
        assert!(registry.remove("jobd-4").expect("remove"));
        assert!(!registry.remove("jobd-4").expect("remove again"));
        assert!(!registry.registered("jobd-4"));
    }
}
