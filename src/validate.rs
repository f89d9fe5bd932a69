//! Post-run output validation: expected files exist and the encoded artifact
//! is readable media.
use std::path::{Path, PathBuf};

pub const NO_OUTPUT_FILE: &str = "no output file created";
pub const INVALID_ENCODED_FILE: &str = "encoded file is invalid";

/// External "is this artifact structurally valid media" check.
///
/// Implementations may block; the supervisor calls them off the async runtime.
pub trait ArtifactValidator: Send + Sync {
    fn is_valid(&self, path: &Path) -> bool;
}

/// Accepts every artifact. For callers that only care about file existence.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysValid;

impl ArtifactValidator for AlwaysValid {
    fn is_valid(&self, _path: &Path) -> bool {
        true
    }
}

/// Validates artifacts by probing them with ffprobe.
#[derive(Debug, Clone)]
pub struct ProbeValidator {
    ffprobe: PathBuf,
}

impl ProbeValidator {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for ProbeValidator {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl ArtifactValidator for ProbeValidator {
    /// Valid when ffprobe reads the file and finds at least one stream.
    fn is_valid(&self, path: &Path) -> bool {
        let config = ffprobe::Config::builder()
            .ffprobe_bin(&self.ffprobe)
            .build();

        match ffprobe::ffprobe_config(config, path) {
            Ok(info) if info.streams.is_empty() => {
                tracing::debug!(path = %path.display(), "ffprobe found no streams");
                false
            }
            Ok(info) => {
                tracing::debug!(
                    path = %path.display(),
                    streams = info.streams.len(),
                    "ffprobe accepted artifact"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    ffprobe = %self.ffprobe.display(),
                    error = %e,
                    "ffprobe rejected artifact"
                );
                false
            }
        }
    }
}

/// What a finished run is expected to have produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationPlan {
    /// One encoded file, checked for existence and validity.
    Single(PathBuf),
    /// Several numbered artifacts (e.g. thumbnails), checked for existence only.
    Numbered(Vec<PathBuf>),
}

impl ValidationPlan {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            ValidationPlan::Single(path) => std::slice::from_ref(path),
            ValidationPlan::Numbered(paths) => paths,
        }
    }

    pub fn is_multi_artifact(&self) -> bool {
        matches!(self, ValidationPlan::Numbered(_))
    }
}

/// Check the plan against the filesystem. Returns the failure reasons; empty means valid.
///
/// Stops at the first missing file.
pub fn check_outputs(plan: &ValidationPlan, validator: &dyn ArtifactValidator) -> Vec<String> {
    let paths = plan.paths();
    if paths.is_empty() {
        return vec![NO_OUTPUT_FILE.to_string()];
    }

    if let Some(missing) = paths.iter().find(|path| !path.exists()) {
        tracing::debug!(path = %missing.display(), "expected output missing");
        return vec![NO_OUTPUT_FILE.to_string()];
    }

    if let ValidationPlan::Single(path) = plan {
        if !validator.is_valid(path) {
            return vec![INVALID_ENCODED_FILE.to_string()];
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct RejectAll;

    impl ArtifactValidator for RejectAll {
        fn is_valid(&self, _path: &Path) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct CountingValidator {
        calls: AtomicUsize,
    }

    impl ArtifactValidator for CountingValidator {
        fn is_valid(&self, _path: &Path) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_missing_single_output() {
        let dir = tempdir().unwrap();
        let plan = ValidationPlan::Single(dir.path().join("out.mp4"));
        assert_eq!(check_outputs(&plan, &AlwaysValid), vec![NO_OUTPUT_FILE]);
    }

    #[test]
    fn test_existing_valid_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"data").unwrap();
        let plan = ValidationPlan::Single(path);
        assert!(check_outputs(&plan, &AlwaysValid).is_empty());
    }

    #[test]
    fn test_existing_invalid_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"not media").unwrap();
        let plan = ValidationPlan::Single(path);
        assert_eq!(check_outputs(&plan, &RejectAll), vec![INVALID_ENCODED_FILE]);
    }

    #[test]
    fn test_numbered_outputs_skip_validity_check() {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = (1..=3)
            .map(|i| dir.path().join(format!("thumb_{i}.jpg")))
            .collect();
        for path in &paths {
            std::fs::write(path, b"jpg").unwrap();
        }

        let validator = CountingValidator::default();
        let plan = ValidationPlan::Numbered(paths);
        assert!(plan.is_multi_artifact());
        assert!(check_outputs(&plan, &validator).is_empty());
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_numbered_outputs_one_missing() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("thumb_1.jpg");
        std::fs::write(&present, b"jpg").unwrap();
        let plan = ValidationPlan::Numbered(vec![present, dir.path().join("thumb_2.jpg")]);
        assert_eq!(check_outputs(&plan, &AlwaysValid), vec![NO_OUTPUT_FILE]);
    }

    #[test]
    fn test_empty_numbered_plan_fails() {
        let plan = ValidationPlan::Numbered(Vec::new());
        assert_eq!(check_outputs(&plan, &AlwaysValid), vec![NO_OUTPUT_FILE]);
    }

    #[test]
    fn test_ffprobe_missing_binary_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"data").unwrap();
        let validator = ProbeValidator::new(dir.path().join("no-such-ffprobe"));
        assert!(!validator.is_valid(&path));
    }

    // `false` exits non-zero, `true` exits zero with nothing to deserialize.
    #[cfg(unix)]
    #[test]
    fn test_ffprobe_failed_run_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"data").unwrap();
        assert!(!ProbeValidator::new("false").is_valid(&path));
        assert!(!ProbeValidator::new("true").is_valid(&path));
    }
}
