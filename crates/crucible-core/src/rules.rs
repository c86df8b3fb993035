//! Build-env rules: stage definitions, resource limits, and target
//! resolution.
//!
//! A rules file declares an ordered bag of stages under a top-level
//! `stages:` key. The file stem is the build-env name; a worker serves
//! exactly one build-env, selected at startup. Stages reference each
//! other through `depends_on`, and a request's target is resolved to the
//! leaf-to-target chain of its predecessors.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

/// Longest `depends_on` chain the resolver will follow.
pub const MAX_CHAIN_LEN: usize = 64;

/// Stage name reserved for pre-stage request processing (source
/// ingestion, init-test checks). Rules files may not use it.
pub const RESERVED_STAGE_INIT: &str = "init";

/// Per-stage resource limits handed to the sandbox wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Address space cap in megabytes.
    pub address_space_mb: u64,
    /// Wall-clock cap in seconds, enforced by the sandbox.
    pub run_time_sec: f32,
    /// Open file descriptor cap.
    pub file_descriptors: u64,
    /// File write cap in megabytes.
    pub file_writes_mb: u64,
    /// Thread/process cap.
    pub threads: u64,
    /// Combined stdout+stderr byte cap, enforced by the worker.
    pub output_bytes: u64,
}

/// One sandboxed subprocess invocation within a request.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Shell-less command line; may contain the `{sources}` placeholder.
    /// Tokens are split on spaces, so commands and paths must not embed
    /// them.
    pub command: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Name of the stage that must run before this one, if any.
    #[serde(default)]
    pub depends_on: Option<String>,
    pub limits: Limits,
}

/// On-disk shape of a rules file.
#[derive(Debug, Deserialize)]
struct RulesFile {
    stages: Vec<Stage>,
}

/// A validated, indexed bundle of stages loaded from one rules file.
#[derive(Debug, Clone)]
pub struct BuildStages {
    stages: Vec<Stage>,
    by_name: HashMap<String, usize>,
}

/// Errors from loading, validating, or resolving rules.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("failed to read rules from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse rules file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("stage name can't be empty")]
    EmptyStageName,

    #[error("stage name can't be the reserved literal {RESERVED_STAGE_INIT:?}")]
    ReservedStageName,

    #[error("stage {stage:?} has an empty command")]
    EmptyCommand { stage: String },

    #[error("stage {stage:?} limit {field} can't be zero")]
    ZeroLimit { stage: String, field: &'static str },

    #[error("duplicate stage name {name:?}")]
    DuplicateStage { name: String },

    #[error("unknown build-env {name:?}")]
    UnknownBuildEnv { name: String },

    #[error("unknown target stage {target:?}")]
    UnknownTarget { target: String },

    #[error("stage {stage:?} depends on itself")]
    SelfDependency { stage: String },

    #[error("dependency chain for target {target:?} exceeds {MAX_CHAIN_LEN} stages")]
    ChainTooLong { target: String },
}

impl BuildStages {
    /// Validate and index a list of stages.
    ///
    /// # Errors
    ///
    /// Returns a [`RulesError`] for an empty or reserved stage name, an
    /// empty command, a zero limit, or a duplicate stage name. Suspicious
    /// but legal limit values only log a warning.
    pub fn new(stages: Vec<Stage>) -> Result<Self, RulesError> {
        let mut by_name = HashMap::with_capacity(stages.len());

        for (index, stage) in stages.iter().enumerate() {
            validate_stage(stage)?;
            if by_name.insert(stage.name.clone(), index).is_some() {
                return Err(RulesError::DuplicateStage {
                    name: stage.name.clone(),
                });
            }
        }

        Ok(Self { stages, by_name })
    }

    /// Look up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.by_name.get(name).map(|&index| &self.stages[index])
    }

    /// All stages in file order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Resolve a target stage to its full execution chain.
    ///
    /// Starting from the stage named `target`, predecessors are
    /// prepended by following `depends_on` until a stage with no
    /// dependency is reached. The result runs leaf-first and ends with
    /// the target itself.
    ///
    /// Only self-references and chains longer than [`MAX_CHAIN_LEN`] are
    /// detected as cycles; a chain that revisits a name without
    /// self-referencing repeats the stage.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError::UnknownTarget`] if any name along the chain
    /// is not indexed, [`RulesError::SelfDependency`] for a stage that
    /// depends on itself, and [`RulesError::ChainTooLong`] past the
    /// chain cap.
    pub fn stages_for_target(&self, target: &str) -> Result<Vec<Stage>, RulesError> {
        let mut chain: Vec<Stage> = Vec::new();
        let mut current = Some(target.to_owned());

        while let Some(name) = current {
            let stage = self.get(&name).ok_or_else(|| RulesError::UnknownTarget {
                target: name.clone(),
            })?;
            if stage.depends_on.as_deref() == Some(name.as_str()) {
                return Err(RulesError::SelfDependency { stage: name });
            }
            chain.push(stage.clone());
            if chain.len() > MAX_CHAIN_LEN {
                return Err(RulesError::ChainTooLong {
                    target: target.to_owned(),
                });
            }
            current = stage.depends_on.clone();
        }

        chain.reverse();
        Ok(chain)
    }
}

/// All build-envs found in the rules directory, keyed by file stem.
#[derive(Debug, Default)]
pub struct RulesStore {
    build_envs: HashMap<String, BuildStages>,
}

impl RulesStore {
    /// Load every `.json`, `.yml`, and `.yaml` file from `dir`.
    ///
    /// Files with other extensions are skipped with a debug log. Every
    /// parsed file is validated; any violation aborts the load.
    ///
    /// # Errors
    ///
    /// Returns a [`RulesError`] if the directory can't be read, a rules
    /// file fails to parse, or validation rejects a stage.
    pub fn load_dir(dir: &Path) -> Result<Self, RulesError> {
        let entries = fs::read_dir(dir).map_err(|source| RulesError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut build_envs = HashMap::new();

        for entry in entries {
            let entry = entry.map_err(|source| RulesError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();

            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(ext, "json" | "yml" | "yaml") {
                debug!("skipping non-rules file {}", path.display());
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let build_stages = load_file(&path)?;
            debug!(
                build_env = stem,
                stages = build_stages.stages().len(),
                "loaded rules file {}",
                path.display()
            );
            build_envs.insert(stem.to_owned(), build_stages);
        }

        Ok(Self { build_envs })
    }

    /// Look up a build-env by name.
    ///
    /// # Errors
    ///
    /// Returns [`RulesError::UnknownBuildEnv`] if no rules file with that
    /// stem was loaded.
    pub fn get(&self, name: &str) -> Result<&BuildStages, RulesError> {
        self.build_envs
            .get(name)
            .ok_or_else(|| RulesError::UnknownBuildEnv {
                name: name.to_owned(),
            })
    }

    /// Names of all loaded build-envs.
    #[must_use]
    pub fn build_env_names(&self) -> Vec<&str> {
        self.build_envs.keys().map(String::as_str).collect()
    }
}

fn load_file(path: &Path) -> Result<BuildStages, RulesError> {
    let text = fs::read_to_string(path).map_err(|source| RulesError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let parsed: RulesFile = if matches!(ext, "yml" | "yaml") {
        serde_yaml::from_str(&text).map_err(|e| RulesError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    } else {
        serde_json::from_str(&text).map_err(|e| RulesError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    };

    BuildStages::new(parsed.stages)
}

fn validate_stage(stage: &Stage) -> Result<(), RulesError> {
    if stage.name.is_empty() {
        return Err(RulesError::EmptyStageName);
    }
    if stage.name == RESERVED_STAGE_INIT {
        return Err(RulesError::ReservedStageName);
    }
    if stage.command.is_empty() {
        return Err(RulesError::EmptyCommand {
            stage: stage.name.clone(),
        });
    }

    let limits = &stage.limits;
    let zero = |field| RulesError::ZeroLimit {
        stage: stage.name.clone(),
        field,
    };

    if limits.address_space_mb == 0 {
        return Err(zero("address_space_mb"));
    } else if limits.address_space_mb < 64 {
        warn!(stage = %stage.name, "address_space_mb {} seems very low", limits.address_space_mb);
    } else if limits.address_space_mb > 512 {
        warn!(stage = %stage.name, "address_space_mb {} seems too high", limits.address_space_mb);
    }

    if limits.run_time_sec == 0.0 {
        return Err(zero("run_time_sec"));
    } else if limits.run_time_sec < 0.5 {
        warn!(stage = %stage.name, "run_time_sec {:.1} seems very low", limits.run_time_sec);
    } else if limits.run_time_sec > 60.0 {
        warn!(stage = %stage.name, "run_time_sec {:.1} seems too high", limits.run_time_sec);
    }

    if limits.file_descriptors == 0 {
        return Err(zero("file_descriptors"));
    } else if limits.file_descriptors < 3 {
        warn!(stage = %stage.name, "file_descriptors {} seems very low", limits.file_descriptors);
    } else if limits.file_descriptors > 512 {
        warn!(stage = %stage.name, "file_descriptors {} seems too high", limits.file_descriptors);
    }

    if limits.file_writes_mb == 0 {
        return Err(zero("file_writes_mb"));
    } else if limits.file_writes_mb < 1 {
        warn!(stage = %stage.name, "file_writes_mb {} seems very low", limits.file_writes_mb);
    } else if limits.file_writes_mb > 100 {
        warn!(stage = %stage.name, "file_writes_mb {} seems too high", limits.file_writes_mb);
    }

    if limits.threads == 0 {
        return Err(zero("threads"));
    } else if limits.threads < 64 {
        warn!(stage = %stage.name, "threads {} seems very low", limits.threads);
    } else if limits.threads > 2000 {
        warn!(stage = %stage.name, "threads {} seems too high", limits.threads);
    }

    if limits.output_bytes == 0 {
        return Err(zero("output_bytes"));
    } else if limits.output_bytes < 1024 {
        warn!(stage = %stage.name, "output_bytes {} seems very low", limits.output_bytes);
    } else if limits.output_bytes > 1024 * 1024 * 1024 {
        warn!(stage = %stage.name, "output_bytes {} seems too high", limits.output_bytes);
    }

    Ok(())
}
