//! Deterministic stand-in collaborator
//!
//! Produces fixed, input-derived replies so the dispatch core can be
//! exercised without the proprietary model runtime. Also used by the test
//! suite to inject slow replies and negative biometric judgments.

use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::config::EffectiveConfig;
use crate::dispatch::OperationKind;

use super::{ImageFrame, InferenceEngine, InferenceInput, InferenceReply, InferenceStatus};

/// Collaborator stub with configurable status and latency.
#[derive(Debug, Default)]
pub struct StubEngine {
    delay: Option<Duration>,
    status: InferenceStatus,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before replying; used to trip the deadline wrapper.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reply with this status instead of `Ok`.
    pub fn with_status(mut self, status: InferenceStatus) -> Self {
        self.status = status;
        self
    }

    fn fake_crop(kind: OperationKind, artifact: &str, frame: Option<&ImageFrame>) -> Vec<u8> {
        let (w, h) = frame.map_or((0, 0), |f| (f.width, f.height));
        format!("{}:{}:{}x{}", kind.as_str(), artifact, w, h).into_bytes()
    }
}

impl InferenceEngine for StubEngine {
    fn infer(
        &self,
        kind: OperationKind,
        input: &InferenceInput,
        config: &EffectiveConfig,
    ) -> anyhow::Result<InferenceReply> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let mut fields = serde_json::Map::new();
        fields.insert("payload_type".into(), json!(kind.as_str()));
        fields.insert("op_status".into(), json!(self.status.op_status()));
        fields.insert("op_message".into(), json!(self.status.op_message()));
        fields.insert("image_count".into(), json!(input.images.len()));
        // Echo the resolved layer so tests can observe what this call ran with.
        if let Some(min_face_size) = config.min_face_size() {
            fields.insert("min_face_size".into(), json!(min_face_size));
        }
        match kind {
            OperationKind::Validate => {
                fields.insert("face_valid".into(), json!(self.status == InferenceStatus::Ok));
            }
            OperationKind::EstimateAge => {
                fields.insert("age".into(), json!(33.0));
            }
            OperationKind::EnrollOnefa | OperationKind::PredictOnefa => {
                fields.insert("puid".into(), json!("stub-puid"));
                fields.insert("guid".into(), json!("stub-guid"));
            }
            OperationKind::DeleteUser => {
                fields.insert("deleted_puid".into(), json!(input.puid));
            }
            OperationKind::CompareFiles
            | OperationKind::CompareLocal
            | OperationKind::CompareMugshotAndFace
            | OperationKind::CompareMugshotAndEmbeddings => {
                // Confidence is a percentage, not a ratio.
                fields.insert("conf_score".into(), json!(97.5));
            }
            OperationKind::AntiSpoofing => {
                fields.insert("is_spoof".into(), json!(false));
                fields.insert("faces_count".into(), json!(1));
            }
            OperationKind::ScanDocumentFace
            | OperationKind::ScanDocumentBarcode
            | OperationKind::ScanDocumentNoFace => {
                fields.insert("doc_validation_status".into(), json!(0));
            }
            OperationKind::FaceIso => {}
        }

        let mut reply = InferenceReply {
            status: self.status.clone(),
            document: serde_json::Value::Object(fields),
            artifacts: Default::default(),
        };
        if reply.status == InferenceStatus::Ok {
            for artifact in kind.eligible_artifacts() {
                reply.artifacts.insert(
                    *artifact,
                    Self::fake_crop(kind, artifact.as_str(), input.images.first()),
                );
            }
        }
        Ok(reply)
    }

    fn libml_version(&self) -> String {
        "stub-libml/1.0.0".into()
    }
}
