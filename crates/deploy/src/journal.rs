//! Persistent record of a run, for resuming after a failure.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::network::TranscriptEntry;
use crate::spec::{DeploymentSpec, SyncPoint};

/// Name of the journal inside the output directory.
pub const JOURNAL_FILENAME: &str = "journal.json";

/// Name of the lock file inside the output directory.
pub const LOCK_FILENAME: &str = ".lock";

/// What a run has achieved so far.
///
/// Saved after every confirmed unit, configuration step, nonce skip and
/// handover, so a failed run can be resumed where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJournal {
    /// Hash of the deployment the journal belongs to.
    pub config_hash: String,
    pub network: String,
    pub chain_id: u64,
    pub started_at: String,
    pub updated_at: String,
    /// Deployed units (contracts and pairs) by name.
    pub units: BTreeMap<String, Address>,
    /// Sync points whose nonce skips are done.
    pub syncs: Vec<SyncPoint>,
    /// 1-based indices of the configuration steps applied so far.
    pub configured_steps: BTreeSet<usize>,
    pub handover_done: bool,
    pub transcript: Vec<TranscriptEntry>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl RunJournal {
    /// An empty journal for a new run of `spec`.
    pub fn new(spec: &DeploymentSpec) -> Self {
        let timestamp = now();
        Self {
            config_hash: spec.config_hash(),
            network: spec.network.name.clone(),
            chain_id: spec.network.chain_id,
            started_at: timestamp.clone(),
            updated_at: timestamp,
            units: BTreeMap::new(),
            syncs: Vec::new(),
            configured_steps: BTreeSet::new(),
            handover_done: false,
            transcript: Vec::new(),
        }
    }

    pub fn path(outdata: &Path) -> PathBuf {
        outdata.join(JOURNAL_FILENAME)
    }

    /// Load the journal of a previous run, if any.
    pub fn load(outdata: &Path) -> Result<Option<Self>> {
        let path = Self::path(outdata);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read journal from {}", path.display()))?;
        let journal = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse journal {}", path.display()))?;
        Ok(Some(journal))
    }

    /// Resume the previous run of `spec`, or start a new one.
    ///
    /// A journal written for a different deployment is an error unless
    /// `fresh` is set, in which case it is discarded along with any
    /// progress it recorded.
    pub fn resume_or_start(outdata: &Path, spec: &DeploymentSpec, fresh: bool) -> Result<Self> {
        let hash = spec.config_hash();
        match Self::load(outdata)? {
            Some(_) if fresh => {
                tracing::warn!(outdata = %outdata.display(), "Discarding previous journal");
                Ok(Self::new(spec))
            }
            Some(journal) if journal.config_hash == hash => {
                tracing::info!(
                    units = journal.units.len(),
                    configured_steps = journal.configured_steps.len(),
                    handover_done = journal.handover_done,
                    "Resuming previous run"
                );
                Ok(journal)
            }
            Some(journal) => anyhow::bail!(
                "Journal in {} belongs to another deployment (hash {}, expected {}). \
                 Use --fresh to start over.",
                outdata.display(),
                journal.config_hash,
                hash
            ),
            None => Ok(Self::new(spec)),
        }
    }

    /// Write the journal, replacing the previous one atomically.
    pub fn save(&mut self, outdata: &Path) -> Result<()> {
        self.updated_at = now();
        let path = Self::path(outdata);
        let tmp = path.with_extension("json.tmp");

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize journal")?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write journal to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move journal into {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Journal saved");
        Ok(())
    }

    pub fn sync_done(&self, point: &SyncPoint) -> bool {
        self.syncs.contains(point)
    }

    pub fn mark_sync(&mut self, point: SyncPoint) {
        if !self.sync_done(&point) {
            self.syncs.push(point);
        }
    }

    pub fn step_done(&self, index: usize) -> bool {
        self.configured_steps.contains(&index)
    }

    pub fn mark_step(&mut self, index: usize) {
        self.configured_steps.insert(index);
    }

    /// Index of the first configuration step not applied yet.
    pub fn first_pending_step(&self) -> usize {
        (1..).find(|i| !self.step_done(*i)).unwrap_or(1)
    }
}

/// Exclusive lock on an output directory, held for the whole run.
///
/// Two runs sharing a directory would share the signer's nonce sequence.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(outdata: &Path) -> Result<Self> {
        std::fs::create_dir_all(outdata)
            .with_context(|| format!("Failed to create {}", outdata.display()))?;

        let path = outdata.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another run is using {}; wait for it to finish",
                outdata.display()
            )
        })?;

        tracing::debug!(path = %path.display(), "Lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{NetworkConfig, Phase};

    fn spec() -> DeploymentSpec {
        toml::from_str(
            r#"
[network]
name = "local"
chain_id = 31337
rpc_url = "http://localhost:8545"
deployer = "0x1000000000000000000000000000000000000001"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_save_and_resume() {
        let dir = tempdir::TempDir::new("deistack-journal").unwrap();
        let spec = spec();

        let mut journal = RunJournal::resume_or_start(dir.path(), &spec, false).unwrap();
        assert!(journal.units.is_empty());
        journal.units.insert("dei".into(), Address::repeat_byte(2));
        journal.mark_sync(SyncPoint::Phase(Phase::Deploy));
        journal.mark_sync(SyncPoint::Phase(Phase::Deploy));
        journal.mark_step(1);
        journal.mark_step(3);
        journal.save(dir.path()).unwrap();

        let resumed = RunJournal::resume_or_start(dir.path(), &spec, false).unwrap();
        assert_eq!(resumed.units, journal.units);
        assert_eq!(resumed.syncs.len(), 1);
        assert!(resumed.step_done(3));
        assert!(!resumed.step_done(2));
        assert_eq!(resumed.first_pending_step(), 2);
    }

    #[test]
    fn test_other_deployment_is_rejected_unless_fresh() {
        let dir = tempdir::TempDir::new("deistack-journal").unwrap();
        let spec = spec();
        let mut journal = RunJournal::new(&spec);
        journal.mark_step(1);
        journal.save(dir.path()).unwrap();

        let mut other = spec.clone();
        other.network = NetworkConfig {
            chain_id: 1,
            ..other.network
        };
        assert!(RunJournal::resume_or_start(dir.path(), &other, false).is_err());

        let fresh = RunJournal::resume_or_start(dir.path(), &other, true).unwrap();
        assert!(fresh.configured_steps.is_empty());
        assert_eq!(fresh.chain_id, 1);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir::TempDir::new("deistack-journal").unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        assert!(RunLock::acquire(dir.path()).is_err());
        drop(lock);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }
}
