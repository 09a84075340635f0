//! Inference collaborator boundary
//!
//! The biometric algorithms (detection, embedding, matching, liveness,
//! document OCR/barcode decoding) live behind [`InferenceEngine`]. The
//! dispatch core never interprets a reply beyond its status discriminator;
//! the rest of the reply is an opaque document plus named byte artifacts
//! that get repackaged for the caller.

pub mod stub;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::config::EffectiveConfig;
use crate::dispatch::OperationKind;
use crate::error::{FacegateError, Result};

pub use stub::StubEngine;

/// One raw input image: caller-supplied bytes with explicit dimensions.
/// The core never decodes these; they pass straight through to the
/// collaborator.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        ImageFrame { data, width, height }
    }
}

/// Everything an operation forwards to the collaborator. Which fields are
/// populated depends on the operation kind.
#[derive(Debug, Clone, Default)]
pub struct InferenceInput {
    pub images: Vec<ImageFrame>,
    pub puid: Option<String>,
    pub encrypted_embeddings: Option<String>,
    pub fudge_factor: Option<f32>,
}

/// Collaborator outcome discriminator. A negative biometric judgment is a
/// normal reply, not a dispatch failure.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum InferenceStatus {
    #[default]
    Ok,
    FaceNotDetected,
    Failed { code: i32, message: String },
}

impl InferenceStatus {
    /// The `op_status` value written into result documents. Zero is
    /// reserved for `Ok`; a collaborator failure reporting code 0 is
    /// normalized to -1 so it stays distinguishable in the document.
    pub fn op_status(&self) -> i32 {
        match self {
            InferenceStatus::Ok => 0,
            InferenceStatus::FaceNotDetected => 1,
            InferenceStatus::Failed { code: 0, .. } => -1,
            InferenceStatus::Failed { code, .. } => *code,
        }
    }

    pub fn op_message(&self) -> &str {
        match self {
            InferenceStatus::Ok => "ok",
            InferenceStatus::FaceNotDetected => "face not detected",
            InferenceStatus::Failed { message, .. } => message,
        }
    }
}

/// Derived payloads an operation may produce alongside its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    CroppedDocument,
    CroppedFace,
    CroppedBarcode,
    CroppedMugshot,
    IsoFace,
    BestInput,
    SpoofVector,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::CroppedDocument => "cropped_document",
            ArtifactKind::CroppedFace => "cropped_face",
            ArtifactKind::CroppedBarcode => "cropped_barcode",
            ArtifactKind::CroppedMugshot => "cropped_mugshot",
            ArtifactKind::IsoFace => "iso_face",
            ArtifactKind::BestInput => "best_input",
            ArtifactKind::SpoofVector => "spoof_vector",
        }
    }
}

/// Opaque collaborator reply: a status, an operation-specific document the
/// core copies into the result, and any derived byte payloads.
#[derive(Debug, Clone)]
pub struct InferenceReply {
    pub status: InferenceStatus,
    pub document: Value,
    pub artifacts: HashMap<ArtifactKind, Vec<u8>>,
}

impl InferenceReply {
    pub fn ok(document: Value) -> Self {
        InferenceReply {
            status: InferenceStatus::Ok,
            document,
            artifacts: HashMap::new(),
        }
    }

    pub fn with_artifact(mut self, kind: ArtifactKind, bytes: Vec<u8>) -> Self {
        self.artifacts.insert(kind, bytes);
        self
    }
}

/// The pluggable collaborator. Implementations must be safe to call from
/// multiple threads; the dispatcher invokes them outside any session lock.
pub trait InferenceEngine: Send + Sync {
    fn infer(
        &self,
        kind: OperationKind,
        input: &InferenceInput,
        config: &EffectiveConfig,
    ) -> anyhow::Result<InferenceReply>;

    /// Version string of the underlying model runtime.
    fn libml_version(&self) -> String;
}

/// Run the collaborator, optionally bounded by a deadline. On expiry the
/// worker thread is left to finish on its own and its reply is dropped;
/// the caller sees `InferenceTimeout` and commits nothing.
pub fn infer_with_deadline(
    engine: &Arc<dyn InferenceEngine>,
    kind: OperationKind,
    input: InferenceInput,
    config: EffectiveConfig,
    deadline: Option<Duration>,
) -> Result<InferenceReply> {
    let Some(limit) = deadline else {
        return engine
            .infer(kind, &input, &config)
            .map_err(FacegateError::InferenceFailed);
    };

    let (sender, receiver) = mpsc::channel();
    let engine = Arc::clone(engine);
    thread::spawn(move || {
        let reply = engine.infer(kind, &input, &config);
        let _ = sender.send(reply);
    });

    match receiver.recv_timeout(limit) {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(FacegateError::InferenceFailed(e)),
        Err(_) => {
            warn!(kind = kind.as_str(), timeout_ms = limit.as_millis() as u64,
                  "inference deadline expired");
            Err(FacegateError::InferenceTimeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigLayer};

    fn effective() -> EffectiveConfig {
        resolve(
            &ConfigLayer::library_defaults(),
            &ConfigLayer::default(),
            &ConfigLayer::default(),
        )
    }

    fn one_frame() -> InferenceInput {
        InferenceInput {
            images: vec![ImageFrame::new(vec![0u8; 16], 2, 2)],
            ..InferenceInput::default()
        }
    }

    #[test]
    fn deadline_expiry_surfaces_timeout() {
        let engine: Arc<dyn InferenceEngine> =
            Arc::new(StubEngine::new().with_delay(Duration::from_millis(200)));
        let result = infer_with_deadline(
            &engine,
            OperationKind::Validate,
            one_frame(),
            effective(),
            Some(Duration::from_millis(10)),
        );
        assert!(matches!(
            result,
            Err(FacegateError::InferenceTimeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn zero_failure_codes_stay_distinguishable_from_ok() {
        let zero = InferenceStatus::Failed {
            code: 0,
            message: "model load failed".into(),
        };
        assert_ne!(zero.op_status(), InferenceStatus::Ok.op_status());
        assert_eq!(zero.op_status(), -1);

        let carried = InferenceStatus::Failed {
            code: 42,
            message: "x".into(),
        };
        assert_eq!(carried.op_status(), 42);
    }

    #[test]
    fn fast_replies_pass_through_the_deadline() {
        let engine: Arc<dyn InferenceEngine> = Arc::new(StubEngine::new());
        let reply = infer_with_deadline(
            &engine,
            OperationKind::Validate,
            one_frame(),
            effective(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(reply.status, InferenceStatus::Ok);
    }
}
