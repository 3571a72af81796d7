//! Static source registry.

use crate::adapter::{AnnotationSourceAdapter, SourceContext};
use crate::clinvar::ClinvarSource;
use crate::ensembl::EnsemblSource;
use crate::gnomad::GnomadSource;
use crate::hgnc::HgncSource;
use geneweave_core::constants::PRIORITY_SOURCE;
use geneweave_core::SourceResult;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an adapter from shared services.
pub type SourceConstructor = fn(&SourceContext) -> SourceResult<Arc<dyn AnnotationSourceAdapter>>;

fn hgnc(ctx: &SourceContext) -> SourceResult<Arc<dyn AnnotationSourceAdapter>> {
    Ok(Arc::new(HgncSource::new(ctx)?))
}

fn gnomad(ctx: &SourceContext) -> SourceResult<Arc<dyn AnnotationSourceAdapter>> {
    Ok(Arc::new(GnomadSource::new(ctx)?))
}

fn clinvar(ctx: &SourceContext) -> SourceResult<Arc<dyn AnnotationSourceAdapter>> {
    Ok(Arc::new(ClinvarSource::new(ctx)?))
}

fn ensembl(ctx: &SourceContext) -> SourceResult<Arc<dyn AnnotationSourceAdapter>> {
    Ok(Arc::new(EnsemblSource::new(ctx)?))
}

const BUILTIN_SOURCES: &[(&str, SourceConstructor)] = &[
    ("hgnc", hgnc),
    ("gnomad", gnomad),
    ("clinvar", clinvar),
    ("ensembl", ensembl),
];

/// Every source this crate ships, by name.
pub fn builtin_sources() -> &'static [(&'static str, SourceConstructor)] {
    BUILTIN_SOURCES
}

/// Known adapters keyed by source name, plus the name of the priority
/// source every other source depends on.
#[derive(Clone)]
pub struct SourceRegistry {
    adapters: BTreeMap<String, Arc<dyn AnnotationSourceAdapter>>,
    priority: String,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
            priority: PRIORITY_SOURCE.to_string(),
        }
    }

    pub fn with_priority(mut self, name: impl Into<String>) -> Self {
        self.priority = name.into();
        self
    }

    /// Construct every built-in source.
    pub fn from_builtin(ctx: &SourceContext) -> SourceResult<Self> {
        let mut registry = Self::new();
        for (name, construct) in builtin_sources() {
            let adapter = construct(ctx)?;
            tracing::debug!(source = %name, "Registered source");
            registry.register(adapter);
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one with the same name.
    pub fn register(&mut self, adapter: Arc<dyn AnnotationSourceAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnnotationSourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn priority(&self) -> &str {
        &self.priority
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Names not known to the registry.
    pub fn unknown<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        names
            .iter()
            .filter(|n| !self.adapters.contains_key(n.as_str()))
            .map(String::as_str)
            .collect()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .field("priority", &self.priority)
            .finish()
    }
}
