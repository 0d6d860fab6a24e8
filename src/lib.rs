//! Bridge between the application and the out-of-process text analysis
//! pipelines: launching, retrying, parsing and degrading gracefully.

pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod invoker;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod pool;
pub mod request;
pub mod retry;
pub mod service;

pub use config::BridgeConfig;
pub use error::{BridgeError, FailureKind, ProcessingError, Result};
pub use model::{AnalysisResponse, ClassificationEntry, CoachingCard, LegacyTag, Payload, Sentiment};
pub use request::AnalysisRequest;
pub use service::AnalysisService;
