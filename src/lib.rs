//! facegate — session, configuration, and dispatch core for a biometric
//! processing SDK.
//!
//! The biometric algorithms themselves (detection, embedding, matching,
//! liveness, document scanning) are an external collaborator behind the
//! [`engine::InferenceEngine`] trait. This crate owns everything around
//! them: caller sessions and their layered configuration, transaction id
//! allocation, billing meters, output-buffer ownership, and the per-call
//! dispatch pipeline.

pub mod api;
pub mod billing;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod session;

pub use api::FaceGate;
pub use buffer::{BufferLedger, BufferTicket, OutputBuffer};
pub use config::{ConfigLayer, ConfigPreset, EffectiveConfig, SessionSettings};
pub use dispatch::{DispatchOutcome, Dispatcher, OperationKind, OperationRequest, OutputRequest};
pub use engine::{
    ArtifactKind, ImageFrame, InferenceEngine, InferenceInput, InferenceReply, InferenceStatus,
    StubEngine,
};
pub use error::{FacegateError, Result};
pub use session::{Session, SessionHandle, SessionRegistry};
