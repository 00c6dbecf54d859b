//! Interface to the external vision library that detects faces and
//! computes their embeddings.

use crate::types::{BoundingBox, DetectedFace, Embedding};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to launch embedding helper {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding helper exited with {status} for {image}: {stderr}")]
    HelperFailed {
        image: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("embedding helper produced invalid output: {0}")]
    InvalidOutput(String),
}

/// Turns an image into zero or more detected faces with embeddings.
pub trait EmbeddingProvider {
    fn embed(&mut self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn embed(&mut self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).embed(image)
    }
}

#[derive(Deserialize)]
struct HelperOutput {
    faces: Vec<HelperFace>,
}

#[derive(Deserialize)]
struct HelperFace {
    bounding_box: BoundingBox,
    embedding: Vec<f32>,
}

/// Runs an external helper program per image and parses its JSON output.
///
/// The image path is appended as the last argument. The helper prints
/// `{"faces":[{"bounding_box":{"top":..,"right":..,"bottom":..,"left":..},"embedding":[..]}]}`
/// on stdout and exits zero; an image without faces yields an empty list.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    expected_dim: Option<usize>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            expected_dim: None,
        }
    }

    /// Reject embeddings whose length differs from `dim`.
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    fn parse(&self, stdout: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
        let output: HelperOutput = serde_json::from_slice(stdout)
            .map_err(|e| ProviderError::InvalidOutput(e.to_string()))?;

        let mut dim = self.expected_dim;
        let mut faces = Vec::with_capacity(output.faces.len());
        for face in output.faces {
            let found = face.embedding.len();
            if found == 0 {
                return Err(ProviderError::InvalidOutput("empty embedding".into()));
            }
            match dim {
                Some(expected) if expected != found => {
                    return Err(ProviderError::InvalidOutput(format!(
                        "expected {expected}-dim embedding, got {found}"
                    )));
                }
                Some(_) => {}
                None => dim = Some(found),
            }
            faces.push(DetectedFace {
                bounding_box: face.bounding_box,
                embedding: Embedding::new(face.embedding),
            });
        }
        Ok(faces)
    }
}

impl EmbeddingProvider for CommandProvider {
    fn embed(&mut self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .output()
            .map_err(|source| ProviderError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProviderError::HelperFailed {
                image: image.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let faces = self.parse(&output.stdout)?;
        tracing::debug!(image = %image.display(), faces = faces.len(), "embeddings extracted");
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CommandProvider {
        CommandProvider::new("unused", Vec::new())
    }

    #[test]
    fn test_parse_faces() {
        let json = br#"{"faces":[{"bounding_box":{"top":1,"right":20,"bottom":30,"left":4},"embedding":[0.5,-0.5]}]}"#;
        let faces = provider().parse(json).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bounding_box.right, 20);
        assert_eq!(faces[0].embedding.values(), &[0.5, -0.5]);
    }

    #[test]
    fn test_parse_no_faces() {
        assert!(provider().parse(br#"{"faces":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_inconsistent_dimensions() {
        let json = br#"{"faces":[
            {"bounding_box":{"top":0,"right":1,"bottom":1,"left":0},"embedding":[0.1,0.2]},
            {"bounding_box":{"top":0,"right":1,"bottom":1,"left":0},"embedding":[0.1]}
        ]}"#;
        assert!(matches!(provider().parse(json), Err(ProviderError::InvalidOutput(_))));
    }

    #[test]
    fn test_parse_enforces_expected_dim() {
        let json = br#"{"faces":[{"bounding_box":{"top":0,"right":1,"bottom":1,"left":0},"embedding":[0.1,0.2]}]}"#;
        let err = provider().with_expected_dim(128).parse(json).unwrap_err();
        assert!(err.to_string().contains("expected 128-dim"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(provider().parse(b"Traceback (most recent call last)").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_embed_runs_helper_with_image_argument() {
        // `sh -c <script> <argv0> <image>`: echo the faces JSON only when the
        // image path arrives as the final argument.
        let script = r#"[ "$1" = "/tmp/probe.png" ] && echo '{"faces":[{"bounding_box":{"top":0,"right":2,"bottom":2,"left":0},"embedding":[1.0]}]}'"#;
        let mut provider = CommandProvider::new("sh", vec!["-c".into(), script.into(), "helper".into()]);
        let faces = provider.embed(Path::new("/tmp/probe.png")).unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_embed_reports_helper_failure() {
        let mut provider = CommandProvider::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into(), "helper".into()]);
        let err = provider.embed(Path::new("/tmp/x.png")).unwrap_err();
        match err {
            ProviderError::HelperFailed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
