//! Contract creation code.
//!
//! Creation code is the compiled bytecode of a contract followed by its
//! ABI-encoded constructor arguments. Bytecode comes from Hardhat-style
//! artifacts (`<root>/**/<Contract>.json` with a `bytecode` field); dry runs
//! use deterministic placeholder bytecode instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use alloy_core::primitives::{Bytes, keccak256};
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::abi::{self, AbiValue};

/// The fields of a compiled artifact we care about.
#[derive(Debug, Deserialize)]
struct Artifact {
    bytecode: Bytes,
}

/// Where contract bytecode comes from.
#[derive(Debug, Clone)]
pub enum ArtifactStore {
    /// Artifacts found under a directory, indexed by contract name.
    Directory {
        root: PathBuf,
        index: HashMap<String, PathBuf>,
    },
    /// Placeholder bytecode derived from the contract name.
    Synthetic,
}

impl ArtifactStore {
    /// Index every `<Contract>.json` found under `root`.
    ///
    /// Hardhat debug files (`*.dbg.json`) are skipped. When the same contract
    /// name appears twice, the first path in lexical order wins.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("Artifacts directory not found: {}", root.display());
        }

        let mut files = Vec::new();
        collect_json_files(root, &mut files)?;
        files.sort();

        let mut index = HashMap::new();
        for path in files {
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            if name.ends_with(".dbg") {
                continue;
            }
            index.entry(name.to_string()).or_insert(path);
        }

        tracing::debug!(root = %root.display(), artifacts = index.len(), "Artifacts indexed");
        Ok(Self::Directory {
            root: root.to_path_buf(),
            index,
        })
    }

    pub fn synthetic() -> Self {
        Self::Synthetic
    }

    /// Compiled bytecode of a contract.
    pub fn bytecode(&self, contract: &str) -> Result<Bytes> {
        match self {
            Self::Directory { root, index } => {
                let path = index.get(contract).with_context(|| {
                    format!(
                        "No artifact for contract `{}` under {}",
                        contract,
                        root.display()
                    )
                })?;
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read artifact {}", path.display()))?;
                let artifact: Artifact = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse artifact {}", path.display()))?;
                if artifact.bytecode.is_empty() {
                    anyhow::bail!(
                        "Artifact for `{}` has no bytecode (abstract contract or interface?)",
                        contract
                    );
                }
                Ok(artifact.bytecode)
            }
            Self::Synthetic => Ok(keccak256(contract.as_bytes()).to_vec().into()),
        }
    }

    /// Bytecode followed by the encoded constructor arguments.
    pub fn creation_code(&self, contract: &str, ctor_args: &[AbiValue]) -> Result<Bytes> {
        let mut code = self.bytecode(contract)?.to_vec();
        code.extend(abi::encode(ctor_args));
        Ok(code.into())
    }
}

fn collect_json_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_json_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(())
}
