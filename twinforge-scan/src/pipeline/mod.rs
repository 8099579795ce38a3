//! Morph pipeline
//!
//! Pure building blocks shared by the scan endpoints. Nothing in here does
//! network I/O; database and model access sit behind the `BoundsSource` and
//! `VocabularySource` traits.

pub mod bounds;
pub mod envelope;
pub mod matching;
pub mod measurements;
pub mod prompt;
pub mod refine;
pub mod reply;
pub mod semantic;
pub mod stage;

pub use bounds::{compute_bounds, BoundsSource};
pub use envelope::{build_envelope, Envelope, EnvelopeRange, EnvelopeSource, ENVELOPE_K};
pub use measurements::{enhance_measurements, DeclaredBody, EnhancedMeasurements, RawMeasurements};
pub use prompt::{build_refinement_prompt, BodyRatios, RefinementContext};
pub use refine::{clamp_to_envelope, parse_refinement_reply, ClampOutcome, RefinementReply};
pub use reply::ReplyError;
pub use semantic::{validate_semantic_with_db, SemanticProfile, SemanticVocabulary, VocabularySource};
pub use stage::PipelineStage;
