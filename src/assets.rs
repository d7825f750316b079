//! Offline model files
//!
//! Models live under one directory, one entry per kind. Speech models are
//! directories carrying an acoustic model marker; the classification model
//! is a single file.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// File whose presence marks a complete speech model directory
const SPEECH_MODEL_MARKER: &str = "am/final.mdl";

/// Default file name of the classification model
pub const DEFAULT_CLASSIFY_FILE: &str = "model.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Wake,
    Transcribe,
    Classify,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Wake, ModelKind::Transcribe, ModelKind::Classify];

    fn dir_name(&self) -> &'static str {
        match self {
            ModelKind::Wake => "wake",
            ModelKind::Transcribe => "transcribe",
            ModelKind::Classify => "llm",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Where models come from and whether the required ones are present
pub trait AssetProvider: Send + Sync {
    /// True when every required model is present and usable
    fn check_prerequisites(&self) -> bool;

    fn model_path(&self, kind: ModelKind) -> PathBuf;
}

/// Models unpacked under a single root directory
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    root: PathBuf,
    required: Vec<ModelKind>,
    classify_file: String,
}

impl ModelDirectory {
    pub fn new(root: impl Into<PathBuf>, required: Vec<ModelKind>) -> Self {
        Self {
            root: root.into(),
            required,
            classify_file: DEFAULT_CLASSIFY_FILE.to_string(),
        }
    }

    pub fn with_classify_file(mut self, file_name: impl Into<String>) -> Self {
        self.classify_file = file_name.into();
        self
    }

    pub fn is_ready(&self, kind: ModelKind) -> bool {
        let path = self.model_path(kind);
        let check = match kind {
            ModelKind::Wake | ModelKind::Transcribe => path.join(SPEECH_MODEL_MARKER),
            ModelKind::Classify => path.clone(),
        };
        let ready = non_empty_file(&check);
        debug!(%kind, ?path, ready, "model check");
        ready
    }

    /// Every kind with a usable model on disk, required or not
    pub fn installed(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| self.is_ready(*kind))
            .collect()
    }
}

impl AssetProvider for ModelDirectory {
    fn check_prerequisites(&self) -> bool {
        let missing: Vec<_> = self
            .required
            .iter()
            .filter(|kind| !self.is_ready(**kind))
            .collect();

        if !missing.is_empty() {
            warn!(root = ?self.root, ?missing, "required models are missing");
        }
        missing.is_empty()
    }

    fn model_path(&self, kind: ModelKind) -> PathBuf {
        let dir = self.root.join(kind.dir_name());
        match kind {
            ModelKind::Classify => dir.join(&self.classify_file),
            _ => dir,
        }
    }
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
