//! Operation dispatcher
//!
//! Routes every declared operation through the same per-call pipeline:
//! resolve the effective configuration, check the optional operational cap,
//! delegate to the inference collaborator, then package the result and
//! commit the transaction id and billing count in one critical section.
//! Any failure before packaging short-circuits the pipeline and, when the
//! caller asked for output, still produces a result document describing the
//! rejection.

pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::{BufferLedger, OutputBuffer};
use crate::config::{resolve, ConfigLayer};
use crate::engine::{infer_with_deadline, ArtifactKind, InferenceEngine, InferenceInput};
use crate::error::{FacegateError, Result};
use crate::session::{SessionHandle, SessionRegistry};

pub use types::ApiResult;

/// The fourteen declared operations. All follow the same pipeline and
/// differ only in forwarded inputs and eligible derived outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Validate,
    EstimateAge,
    EnrollOnefa,
    PredictOnefa,
    DeleteUser,
    ScanDocumentFace,
    ScanDocumentBarcode,
    ScanDocumentNoFace,
    CompareFiles,
    CompareLocal,
    FaceIso,
    AntiSpoofing,
    CompareMugshotAndFace,
    CompareMugshotAndEmbeddings,
}

impl OperationKind {
    pub const ALL: [OperationKind; 14] = [
        OperationKind::Validate,
        OperationKind::EstimateAge,
        OperationKind::EnrollOnefa,
        OperationKind::PredictOnefa,
        OperationKind::DeleteUser,
        OperationKind::ScanDocumentFace,
        OperationKind::ScanDocumentBarcode,
        OperationKind::ScanDocumentNoFace,
        OperationKind::CompareFiles,
        OperationKind::CompareLocal,
        OperationKind::FaceIso,
        OperationKind::AntiSpoofing,
        OperationKind::CompareMugshotAndFace,
        OperationKind::CompareMugshotAndEmbeddings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Validate => "validate",
            OperationKind::EstimateAge => "estimate_age",
            OperationKind::EnrollOnefa => "enroll_onefa",
            OperationKind::PredictOnefa => "predict_onefa",
            OperationKind::DeleteUser => "user_delete",
            OperationKind::ScanDocumentFace => "doc_scan_face",
            OperationKind::ScanDocumentBarcode => "doc_scan_barcode",
            OperationKind::ScanDocumentNoFace => "scan_doc_with_no_face",
            OperationKind::CompareFiles => "compare_files",
            OperationKind::CompareLocal => "compare_local",
            OperationKind::FaceIso => "face_iso",
            OperationKind::AntiSpoofing => "anti_spoofing",
            OperationKind::CompareMugshotAndFace => "compare_mugshot_and_face",
            OperationKind::CompareMugshotAndEmbeddings => "compare_mugshot_and_embeddings",
        }
    }

    /// Name the billing meter counts this operation under. Document scans
    /// bill by page side: both front-page scans share the front tag even
    /// though the no-face scan reports under its own name.
    pub fn billing_tag(&self) -> &'static str {
        match self {
            OperationKind::ScanDocumentFace | OperationKind::ScanDocumentNoFace => "doc_front",
            OperationKind::ScanDocumentBarcode => "doc_back",
            other => other.as_str(),
        }
    }

    /// Derived outputs this operation may produce. Requests for anything
    /// else are ignored rather than rejected.
    pub fn eligible_artifacts(&self) -> &'static [ArtifactKind] {
        match self {
            OperationKind::EnrollOnefa => &[ArtifactKind::BestInput],
            OperationKind::ScanDocumentFace => {
                &[ArtifactKind::CroppedDocument, ArtifactKind::CroppedFace]
            }
            OperationKind::ScanDocumentBarcode => {
                &[ArtifactKind::CroppedDocument, ArtifactKind::CroppedBarcode]
            }
            OperationKind::ScanDocumentNoFace => &[ArtifactKind::CroppedDocument],
            OperationKind::FaceIso => &[ArtifactKind::IsoFace],
            OperationKind::CompareMugshotAndFace => {
                &[ArtifactKind::CroppedMugshot, ArtifactKind::CroppedFace]
            }
            OperationKind::CompareMugshotAndEmbeddings => &[ArtifactKind::CroppedMugshot],
            OperationKind::AntiSpoofing => &[ArtifactKind::SpoofVector],
            _ => &[],
        }
    }
}

/// Which outputs the caller wants. Anything not requested is never
/// allocated.
#[derive(Debug, Clone, Default)]
pub struct OutputRequest {
    pub result_document: bool,
    pub artifacts: Vec<ArtifactKind>,
}

impl OutputRequest {
    /// No outputs at all; the caller only reads the return value.
    pub fn none() -> Self {
        Self::default()
    }

    /// Result document only.
    pub fn document() -> Self {
        OutputRequest {
            result_document: true,
            artifacts: Vec::new(),
        }
    }

    /// Result document plus every artifact the operation can produce.
    pub fn full(kind: OperationKind) -> Self {
        OutputRequest {
            result_document: true,
            artifacts: kind.eligible_artifacts().to_vec(),
        }
    }

    pub fn with_artifact(mut self, kind: ArtifactKind) -> Self {
        self.artifacts.push(kind);
        self
    }
}

/// One operation invocation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub input: InferenceInput,
    /// Raw per-call override document; `None` or empty means no override.
    pub override_config: Option<String>,
    pub output: OutputRequest,
}

/// What a call hands back. `transaction_id` follows the legacy signed
/// convention: strictly positive on successful dispatch, the negative
/// taxonomy code otherwise.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub transaction_id: i64,
    pub result: Option<OutputBuffer>,
    pub artifacts: Vec<(ArtifactKind, OutputBuffer)>,
    /// Billing-cycle signal for the caller layer's metering event.
    pub billing_cycled: bool,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.transaction_id > 0
    }
}

/// Stateless pipeline over the registry, the buffer ledger, and the
/// collaborator. Cheap to share; all mutable state lives in the sessions.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    ledger: Arc<BufferLedger>,
    engine: Arc<dyn InferenceEngine>,
    library_defaults: ConfigLayer,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        ledger: Arc<BufferLedger>,
        engine: Arc<dyn InferenceEngine>,
        library_defaults: ConfigLayer,
    ) -> Self {
        Dispatcher {
            registry,
            ledger,
            engine,
            library_defaults,
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Run one operation against a session. Never panics across the
    /// boundary; every failure is folded into the outcome.
    pub fn dispatch(&self, handle: SessionHandle, request: OperationRequest) -> DispatchOutcome {
        let kind = request.kind;
        let output = request.output.clone();
        match self.run(handle, request) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(session = %handle, operation = kind.as_str(), %error,
                      "operation rejected");
                self.reject(&output, error)
            }
        }
    }

    fn run(&self, handle: SessionHandle, request: OperationRequest) -> Result<DispatchOutcome> {
        let kind = request.kind;
        debug!(session = %handle, operation = kind.as_str(), "operation received");

        let session = self.registry.lookup(handle)?;

        // ConfigResolved: merge the three layers; a malformed override
        // aborts before any side effect.
        let override_layer = ConfigLayer::parse_override(request.override_config.as_deref())?;
        let effective = resolve(
            &self.library_defaults,
            &session.session_defaults(),
            &override_layer,
        );

        // BillingChecked: billing only gates when a hard cap is configured.
        // This check rejects a call that is already over the cap before it
        // reaches the collaborator; the commit below re-checks under the
        // session lock, so concurrent in-flight calls cannot overshoot.
        let tag = kind.billing_tag();
        let cap = effective.billing_hard_cap();
        if let Some(cap) = cap {
            if session.lifetime_total(tag) >= cap {
                return Err(FacegateError::BillingCapExceeded { kind: tag, cap });
            }
        }

        // Delegated: the collaborator runs outside every lock. Nothing has
        // committed yet, so a timeout or collaborator failure costs the
        // session neither a transaction id nor a billing count.
        let deadline = effective.inference_timeout_ms().map(Duration::from_millis);
        let reply = infer_with_deadline(
            &self.engine,
            kind,
            request.input,
            effective.clone(),
            deadline,
        )?;

        // Commit: cap check, id allocation, and billing count in one
        // critical section.
        let (transaction_id, tick) = session.commit(tag, cap)?;
        if tick.cycled {
            info!(session = %handle, operation = tag, lifetime = tick.lifetime,
                  "billing threshold reached, counter cycled");
        }

        // ResultPackaged: allocate only what the caller asked for.
        let mut artifacts = Vec::new();
        let mut reply_artifacts = reply.artifacts;
        for wanted in &request.output.artifacts {
            if !kind.eligible_artifacts().contains(wanted) {
                continue;
            }
            if let Some(bytes) = reply_artifacts.remove(wanted) {
                artifacts.push((*wanted, self.ledger.issue(bytes)));
            }
        }
        let result = if request.output.result_document {
            let document = ApiResult::success(transaction_id as i64, reply.document);
            Some(self.ledger.issue(document.to_bytes()?))
        } else {
            None
        };

        debug!(session = %handle, operation = kind.as_str(), transaction_id,
               "operation returned");
        Ok(DispatchOutcome {
            transaction_id: transaction_id as i64,
            result,
            artifacts,
            billing_cycled: tick.cycled,
        })
    }

    /// Fold a rejection into the outcome, still honoring the caller's
    /// request for a result document.
    pub(crate) fn reject(&self, output: &OutputRequest, error: FacegateError) -> DispatchOutcome {
        let result = if output.result_document {
            ApiResult::rejection(&error)
                .to_bytes()
                .ok()
                .map(|bytes| self.ledger.issue(bytes))
        } else {
            None
        };
        DispatchOutcome {
            transaction_id: error.status_code() as i64,
            result,
            artifacts: Vec::new(),
            billing_cycled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ImageFrame, InferenceStatus, StubEngine};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::thread;

    const SETTINGS: &str = r#"{"api_key": "k", "base_url": "https://api.example.com"}"#;

    fn harness(engine: StubEngine) -> (Dispatcher, Arc<SessionRegistry>, SessionHandle) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let registry = Arc::new(SessionRegistry::new());
        let ledger = Arc::new(BufferLedger::new());
        let handle = registry.create(SETTINGS).unwrap();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            ledger,
            Arc::new(engine),
            ConfigLayer::library_defaults(),
        );
        (dispatcher, registry, handle)
    }

    fn frame() -> ImageFrame {
        ImageFrame::new(vec![0u8; 16], 2, 2)
    }

    fn request(kind: OperationKind, output: OutputRequest) -> OperationRequest {
        OperationRequest {
            kind,
            input: InferenceInput {
                images: vec![frame()],
                ..InferenceInput::default()
            },
            override_config: None,
            output,
        }
    }

    fn result_json(outcome: &DispatchOutcome) -> Value {
        serde_json::from_slice(outcome.result.as_ref().unwrap().as_bytes()).unwrap()
    }

    #[test]
    fn transaction_ids_increase_from_one() {
        let (dispatcher, _, handle) = harness(StubEngine::new());
        for expected in 1..=5i64 {
            let outcome = dispatcher.dispatch(
                handle,
                request(OperationKind::Validate, OutputRequest::none()),
            );
            assert_eq!(outcome.transaction_id, expected);
        }
    }

    #[test]
    fn every_operation_rejects_unknown_handles_with_a_document() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        registry.destroy(handle).unwrap();

        for kind in OperationKind::ALL {
            let outcome = dispatcher.dispatch(handle, request(kind, OutputRequest::document()));
            assert!(!outcome.succeeded(), "{kind:?}");
            assert_eq!(outcome.transaction_id, -1);
            let doc = result_json(&outcome);
            assert_eq!(doc["call_status_name"], "invalid_handle");
        }
    }

    #[test]
    fn overrides_do_not_stick_to_session_defaults() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        let session = registry.lookup(handle).unwrap();
        session.apply_as_session_default(
            &ConfigLayer::parse(r#"{"min_face_size": 80}"#).unwrap(),
        );

        let plain = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::document()),
        );
        assert_eq!(result_json(&plain)["min_face_size"], 80);

        let mut overridden = request(OperationKind::Validate, OutputRequest::document());
        overridden.override_config = Some(r#"{"min_face_size": 40}"#.into());
        let overridden = dispatcher.dispatch(handle, overridden);
        assert_eq!(result_json(&overridden)["min_face_size"], 40);

        // The stored default is untouched.
        let again = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::document()),
        );
        assert_eq!(result_json(&again)["min_face_size"], 80);
    }

    #[test]
    fn malformed_override_rejects_before_any_commit() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        let mut bad = request(OperationKind::Validate, OutputRequest::document());
        bad.override_config = Some("{broken".into());

        let outcome = dispatcher.dispatch(handle, bad);
        assert_eq!(outcome.transaction_id, -3);
        assert_eq!(result_json(&outcome)["call_status_name"], "invalid_configuration");

        let session = registry.lookup(handle).unwrap();
        assert_eq!(session.transaction_count(), 0);
        assert_eq!(session.lifetime_total("validate"), 0);
    }

    #[test]
    fn billing_cycles_on_the_third_validate() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        let session = registry.lookup(handle).unwrap();
        session.set_billing_thresholds(r#"{"validate": 3}"#).unwrap();

        let cycles: Vec<bool> = (0..3)
            .map(|_| {
                dispatcher
                    .dispatch(handle, request(OperationKind::Validate, OutputRequest::none()))
                    .billing_cycled
            })
            .collect();
        assert_eq!(cycles, vec![false, false, true]);

        // A fourth call restarts the cycle at count 1.
        let fourth = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::none()),
        );
        assert!(!fourth.billing_cycled);
        assert_eq!(session.billing_record("validate").unwrap().count, 1);
    }

    #[test]
    fn front_page_scans_share_a_billing_tag() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        dispatcher.dispatch(
            handle,
            request(OperationKind::ScanDocumentFace, OutputRequest::none()),
        );
        dispatcher.dispatch(
            handle,
            request(OperationKind::ScanDocumentNoFace, OutputRequest::none()),
        );
        dispatcher.dispatch(
            handle,
            request(OperationKind::ScanDocumentBarcode, OutputRequest::none()),
        );

        let session = registry.lookup(handle).unwrap();
        assert_eq!(session.lifetime_total("doc_front"), 2);
        assert_eq!(session.lifetime_total("doc_back"), 1);
        assert_eq!(session.lifetime_total("scan_doc_with_no_face"), 0);
    }

    #[test]
    fn hard_cap_rejects_before_delegation() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        let session = registry.lookup(handle).unwrap();
        session.apply_as_session_default(
            &ConfigLayer::parse(r#"{"billing_hard_cap": 2}"#).unwrap(),
        );

        assert!(dispatcher
            .dispatch(handle, request(OperationKind::Validate, OutputRequest::none()))
            .succeeded());
        assert!(dispatcher
            .dispatch(handle, request(OperationKind::Validate, OutputRequest::none()))
            .succeeded());

        let third = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::document()),
        );
        assert_eq!(third.transaction_id, -5);
        assert_eq!(result_json(&third)["call_status_name"], "billing_cap_exceeded");
        // The rejected call committed nothing.
        assert_eq!(session.transaction_count(), 2);
        assert_eq!(session.lifetime_total("validate"), 2);
    }

    #[test]
    fn negative_judgment_is_a_successful_dispatch() {
        let (dispatcher, _, handle) = harness(
            StubEngine::new().with_status(InferenceStatus::FaceNotDetected),
        );
        let outcome = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::document()),
        );
        assert_eq!(outcome.transaction_id, 1);
        let doc = result_json(&outcome);
        assert_eq!(doc["call_status"], 0);
        assert_eq!(doc["op_status"], 1);
        assert_eq!(doc["op_message"], "face not detected");
    }

    #[test]
    fn timed_out_calls_commit_nothing() {
        let (dispatcher, registry, handle) = harness(
            StubEngine::new().with_delay(Duration::from_millis(150)),
        );
        let session = registry.lookup(handle).unwrap();
        session.apply_as_session_default(
            &ConfigLayer::parse(r#"{"inference_timeout_ms": 10}"#).unwrap(),
        );

        let outcome = dispatcher.dispatch(
            handle,
            request(OperationKind::Validate, OutputRequest::document()),
        );
        assert_eq!(outcome.transaction_id, -6);
        assert_eq!(result_json(&outcome)["call_status_name"], "inference_timeout");
        assert_eq!(session.transaction_count(), 0);
        assert_eq!(session.lifetime_total("validate"), 0);
    }

    #[test]
    fn only_requested_outputs_are_allocated() {
        let (dispatcher, _, handle) = harness(StubEngine::new());

        let silent = dispatcher.dispatch(
            handle,
            request(OperationKind::ScanDocumentFace, OutputRequest::none()),
        );
        assert!(silent.succeeded());
        assert!(silent.result.is_none());
        assert!(silent.artifacts.is_empty());

        let partial = dispatcher.dispatch(
            handle,
            request(
                OperationKind::ScanDocumentFace,
                OutputRequest::document().with_artifact(ArtifactKind::CroppedFace),
            ),
        );
        assert_eq!(partial.artifacts.len(), 1);
        assert_eq!(partial.artifacts[0].0, ArtifactKind::CroppedFace);

        // Ineligible artifact requests are ignored, not failed.
        let ignored = dispatcher.dispatch(
            handle,
            request(
                OperationKind::Validate,
                OutputRequest::document().with_artifact(ArtifactKind::CroppedBarcode),
            ),
        );
        assert!(ignored.succeeded());
        assert!(ignored.artifacts.is_empty());
    }

    #[test]
    fn concurrent_calls_cannot_overshoot_the_hard_cap() {
        // Slow collaborator so every call passes the pre-delegation check
        // before any of them commits; the cap must still hold at commit.
        let (dispatcher, registry, handle) = harness(
            StubEngine::new().with_delay(Duration::from_millis(100)),
        );
        let session = registry.lookup(handle).unwrap();
        session.apply_as_session_default(
            &ConfigLayer::parse(r#"{"billing_hard_cap": 1}"#).unwrap(),
        );
        let dispatcher = Arc::new(dispatcher);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    dispatcher
                        .dispatch(
                            handle,
                            request(OperationKind::Validate, OutputRequest::none()),
                        )
                        .transaction_id
                })
            })
            .collect();
        let ids: Vec<i64> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let successes = ids.iter().filter(|id| **id > 0).count();
        assert_eq!(successes, 1, "cap 1 must admit exactly one call: {ids:?}");
        assert!(ids.iter().filter(|id| **id <= 0).all(|id| *id == -5));
        assert_eq!(session.transaction_count(), 1);
        assert_eq!(session.lifetime_total("validate"), 1);
    }

    #[test]
    fn concurrent_calls_never_duplicate_ids_or_drop_counts() {
        let (dispatcher, registry, handle) = harness(StubEngine::new());
        let dispatcher = Arc::new(dispatcher);
        let threads = 8;
        let calls_per_thread = 25;

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    (0..calls_per_thread)
                        .map(|_| {
                            dispatcher
                                .dispatch(
                                    handle,
                                    request(OperationKind::Validate, OutputRequest::none()),
                                )
                                .transaction_id
                        })
                        .collect::<Vec<i64>>()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for worker in workers {
            ids.extend(worker.join().unwrap());
        }
        let total = (threads * calls_per_thread) as usize;
        assert_eq!(ids.len(), total);
        assert!(ids.iter().all(|id| *id > 0));
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), total);
        assert_eq!(*ids.iter().max().unwrap(), total as i64);

        let session = registry.lookup(handle).unwrap();
        assert_eq!(session.lifetime_total("validate"), total as u64);
    }
}
