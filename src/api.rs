//! Library call surface
//!
//! [`FaceGate`] is the facade the caller holds: library initialization,
//! session lifecycle, configuration and billing setters, one method per
//! operation, and buffer release. Each operation method just assembles an
//! [`OperationRequest`] and hands it to the dispatcher; nothing here holds
//! a lock across a collaborator call.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::{BufferLedger, BufferTicket, OutputBuffer};
use crate::config::{ConfigLayer, ConfigPreset};
use crate::dispatch::{DispatchOutcome, Dispatcher, OperationKind, OperationRequest, OutputRequest};
use crate::engine::{ImageFrame, InferenceEngine, InferenceInput};
use crate::error::{FacegateError, Result};
use crate::session::{SessionHandle, SessionRegistry};

/// Process-level entry point, owning the session registry, the buffer
/// ledger, and the inference collaborator.
pub struct FaceGate {
    registry: Arc<SessionRegistry>,
    ledger: Arc<BufferLedger>,
    dispatcher: Dispatcher,
    models_directory: PathBuf,
}

impl FaceGate {
    /// One-time library initialization: establishes the library-default
    /// configuration layer and remembers where the collaborator loads its
    /// models from.
    pub fn initialize(
        models_directory: impl Into<PathBuf>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        let models_directory = models_directory.into();
        let registry = Arc::new(SessionRegistry::new());
        let ledger = Arc::new(BufferLedger::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            engine,
            ConfigLayer::library_defaults(),
        );
        info!(models_directory = %models_directory.display(), "library initialized");
        FaceGate {
            registry,
            ledger,
            dispatcher,
            models_directory,
        }
    }

    pub fn models_directory(&self) -> &PathBuf {
        &self.models_directory
    }

    // ---- session lifecycle -------------------------------------------------

    pub fn initialize_session(&self, settings_document: &str) -> Result<SessionHandle> {
        self.registry.create(settings_document)
    }

    pub fn deinitialize_session(&self, handle: SessionHandle) -> Result<()> {
        self.registry.destroy(handle)
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    // ---- configuration and billing ----------------------------------------

    /// Apply a named preset (by its legacy type code) to the session
    /// defaults.
    pub fn set_default_configuration(
        &self,
        handle: SessionHandle,
        configuration_type: i32,
    ) -> Result<()> {
        let preset = ConfigPreset::from_code(configuration_type)?;
        let session = self.registry.lookup(handle)?;
        session.apply_as_session_default(&preset.layer());
        Ok(())
    }

    /// Overlay a configuration document onto the session defaults. Keys
    /// the document does not mention are preserved.
    pub fn set_configuration(&self, handle: SessionHandle, user_config: &str) -> Result<()> {
        let layer = ConfigLayer::parse(user_config)?;
        let session = self.registry.lookup(handle)?;
        session.apply_as_session_default(&layer);
        Ok(())
    }

    pub fn set_billing_record_threshold(
        &self,
        handle: SessionHandle,
        billing_config: &str,
    ) -> Result<()> {
        let session = self.registry.lookup(handle)?;
        session.set_billing_thresholds(billing_config)
    }

    // ---- operations --------------------------------------------------------

    pub fn validate(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::Validate, image, user_config, output)
    }

    pub fn estimate_age(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::EstimateAge, image, user_config, output)
    }

    /// 1FA enroll over a flat multi-frame buffer: `image_count` frames of
    /// `image_size` bytes each, all sharing one width and height.
    #[allow(clippy::too_many_arguments)]
    pub fn enroll_onefa(
        &self,
        handle: SessionHandle,
        image_bytes: &[u8],
        image_count: u32,
        image_size: u32,
        image_width: u32,
        image_height: u32,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        match Self::frames(image_bytes, image_count, image_size, image_width, image_height) {
            Ok(input) => self.run(handle, OperationKind::EnrollOnefa, input, user_config, output),
            Err(error) => self.reject_input(handle, OperationKind::EnrollOnefa, &output, error),
        }
    }

    /// 1FA predict, same flat multi-frame buffer convention as enroll.
    #[allow(clippy::too_many_arguments)]
    pub fn face_predict_onefa(
        &self,
        handle: SessionHandle,
        image_bytes: &[u8],
        image_count: u32,
        image_size: u32,
        image_width: u32,
        image_height: u32,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        match Self::frames(image_bytes, image_count, image_size, image_width, image_height) {
            Ok(input) => self.run(handle, OperationKind::PredictOnefa, input, user_config, output),
            Err(error) => self.reject_input(handle, OperationKind::PredictOnefa, &output, error),
        }
    }

    pub fn user_delete(
        &self,
        handle: SessionHandle,
        puid: &str,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            puid: Some(puid.to_string()),
            ..InferenceInput::default()
        };
        self.run(handle, OperationKind::DeleteUser, input, user_config, output)
    }

    pub fn doc_scan_face(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::ScanDocumentFace, image, user_config, output)
    }

    pub fn doc_scan_barcode(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::ScanDocumentBarcode, image, user_config, output)
    }

    pub fn scan_document_with_no_face(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::ScanDocumentNoFace, image, user_config, output)
    }

    /// Compare two face images; `fudge_factor` is the allowance for poor
    /// captures, forwarded opaquely to the collaborator.
    #[allow(clippy::too_many_arguments)]
    pub fn face_compare_files(
        &self,
        handle: SessionHandle,
        fudge_factor: f32,
        image_a: ImageFrame,
        image_b: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            images: vec![image_a, image_b],
            fudge_factor: Some(fudge_factor),
            ..InferenceInput::default()
        };
        self.run(handle, OperationKind::CompareFiles, input, user_config, output)
    }

    pub fn face_compare_local(
        &self,
        handle: SessionHandle,
        image_a: ImageFrame,
        image_b: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            images: vec![image_a, image_b],
            ..InferenceInput::default()
        };
        self.run(handle, OperationKind::CompareLocal, input, user_config, output)
    }

    pub fn face_iso(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::FaceIso, image, user_config, output)
    }

    pub fn anti_spoofing(
        &self,
        handle: SessionHandle,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.run_single(handle, OperationKind::AntiSpoofing, image, user_config, output)
    }

    pub fn compare_mugshot_and_face(
        &self,
        handle: SessionHandle,
        document_image: ImageFrame,
        face_image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            images: vec![document_image, face_image],
            ..InferenceInput::default()
        };
        self.run(handle, OperationKind::CompareMugshotAndFace, input, user_config, output)
    }

    pub fn compare_mugshot_and_embeddings(
        &self,
        handle: SessionHandle,
        document_image: ImageFrame,
        encrypted_embeddings: &str,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            images: vec![document_image],
            encrypted_embeddings: Some(encrypted_embeddings.to_string()),
            ..InferenceInput::default()
        };
        self.run(
            handle,
            OperationKind::CompareMugshotAndEmbeddings,
            input,
            user_config,
            output,
        )
    }

    // ---- buffers and versions ----------------------------------------------

    /// Release a buffer produced by any call. Checked: foreign or
    /// already-released buffers are rejected, never reclaimed.
    pub fn free_buffer(&self, buffer: OutputBuffer) -> Result<()> {
        self.ledger.release(buffer)
    }

    /// Release by ticket for callers that took the bytes out via
    /// [`OutputBuffer::into_parts`].
    pub fn free_buffer_ticket(&self, ticket: BufferTicket) -> Result<()> {
        self.ledger.release_ticket(ticket)
    }

    pub fn outstanding_buffers(&self) -> usize {
        self.ledger.outstanding()
    }

    /// Version of this library.
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Version reported by the collaborator's model runtime.
    pub fn libml_version(&self) -> String {
        self.dispatcher.engine().libml_version()
    }

    // ---- plumbing ----------------------------------------------------------

    fn run_single(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
        image: ImageFrame,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        let input = InferenceInput {
            images: vec![image],
            ..InferenceInput::default()
        };
        self.run(handle, kind, input, user_config, output)
    }

    /// Fold an input-validation failure into an outcome before anything
    /// reaches the dispatcher pipeline.
    fn reject_input(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
        output: &OutputRequest,
        error: FacegateError,
    ) -> DispatchOutcome {
        warn!(session = %handle, operation = kind.as_str(), %error, "operation rejected");
        self.dispatcher.reject(output, error)
    }

    fn run(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
        input: InferenceInput,
        user_config: Option<&str>,
        output: OutputRequest,
    ) -> DispatchOutcome {
        self.dispatcher.dispatch(
            handle,
            OperationRequest {
                kind,
                input,
                override_config: user_config.map(str::to_owned),
                output,
            },
        )
    }

    /// Slice a flat multi-image buffer into frames. The declared counts
    /// are authoritative: a buffer shorter than `image_count * image_size`
    /// is a caller error and is rejected, never silently truncated.
    /// Trailing bytes beyond the declared frames are ignored.
    fn frames(
        image_bytes: &[u8],
        image_count: u32,
        image_size: u32,
        width: u32,
        height: u32,
    ) -> Result<InferenceInput> {
        let declared = u64::from(image_count) * u64::from(image_size);
        if (image_bytes.len() as u64) < declared {
            return Err(FacegateError::InvalidSettings(format!(
                "image buffer holds {} bytes but {} frames of {} bytes were declared",
                image_bytes.len(),
                image_count,
                image_size
            )));
        }
        let size = image_size as usize;
        let images = if size == 0 {
            Vec::new()
        } else {
            image_bytes
                .chunks_exact(size)
                .take(image_count as usize)
                .map(|chunk| ImageFrame::new(chunk.to_vec(), width, height))
                .collect()
        };
        Ok(InferenceInput {
            images,
            ..InferenceInput::default()
        })
    }
}
