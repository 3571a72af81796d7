//! GENEWEAVE Sources
//!
//! The adapter contract every external annotation source implements, the
//! resilience primitives wrapped around their network calls, and the
//! built-in sources:
//!
//! - `hgnc`: identifier resolution, runs before everything else
//! - `gnomad`: constraint metrics via batched GraphQL
//! - `ensembl`: gene lookups
//! - `clinvar`: bulk `variant_summary` aggregation with an E-utilities
//!   fallback

pub mod adapter;
pub mod bulk;
pub mod clinvar;
pub mod ensembl;
pub mod gnomad;
pub mod hgnc;
pub mod http;
pub mod registry;
pub mod resilience;

pub use adapter::{fetch_validated, AnnotationSourceAdapter, SourceContext};
pub use bulk::BulkFileManager;
pub use clinvar::ClinvarSource;
pub use ensembl::EnsemblSource;
pub use gnomad::GnomadSource;
pub use hgnc::HgncSource;
pub use http::SourceHttpClient;
pub use registry::{builtin_sources, SourceConstructor, SourceRegistry};
pub use resilience::{CircuitBreaker, RetryPolicy, SourceRateLimiter};
