//! Entity types persisted by the annotation engine.

use crate::{GeneId, Timestamp};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A gene row as seen by the update engine.
///
/// Identifiers other than `symbol` are filled in by the identifier-resolution
/// source and read back by every later source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gene {
    pub gene_id: GeneId,
    pub symbol: String,
    pub hgnc_id: Option<String>,
    pub ensembl_gene_id: Option<String>,
    pub entrez_id: Option<String>,
    /// Clinical-importance score used to order incremental updates.
    pub clinical_score: f64,
}

impl Gene {
    pub fn new(gene_id: GeneId, symbol: impl Into<String>) -> Self {
        Self {
            gene_id,
            symbol: symbol.into(),
            hgnc_id: None,
            ensembl_gene_id: None,
            entrez_id: None,
            clinical_score: 0.0,
        }
    }

    pub fn with_clinical_score(mut self, score: f64) -> Self {
        self.clinical_score = score;
        self
    }

    pub fn with_ensembl_id(mut self, id: impl Into<String>) -> Self {
        self.ensembl_gene_id = Some(id.into());
        self
    }

    /// Apply resolved identifiers, keeping existing values where the
    /// resolution carries none.
    pub fn apply_identifiers(&mut self, ids: &GeneIdentifiers) {
        if ids.hgnc_id.is_some() {
            self.hgnc_id.clone_from(&ids.hgnc_id);
        }
        if ids.ensembl_gene_id.is_some() {
            self.ensembl_gene_id.clone_from(&ids.ensembl_gene_id);
        }
        if ids.entrez_id.is_some() {
            self.entrez_id.clone_from(&ids.entrez_id);
        }
    }
}

/// Cross-reference identifiers produced by the identifier-resolution source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneIdentifiers {
    pub hgnc_id: Option<String>,
    pub ensembl_gene_id: Option<String>,
    pub entrez_id: Option<String>,
}

impl GeneIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.hgnc_id.is_none() && self.ensembl_gene_id.is_none() && self.entrez_id.is_none()
    }
}

/// Static description of a source, used to create its row lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub source_name: String,
    pub display_name: String,
    /// Annotation schema version written with every payload.
    pub version: String,
    /// How long a completed update stays fresh, in hours.
    pub update_frequency_hours: i64,
    pub base_url: String,
}

impl SourceDefinition {
    pub fn update_frequency(&self) -> ChronoDuration {
        ChronoDuration::hours(self.update_frequency_hours)
    }
}

/// A row of `annotation_sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSource {
    pub source_name: String,
    pub display_name: String,
    pub is_active: bool,
    pub update_frequency_hours: i64,
    pub last_update: Option<Timestamp>,
    pub next_update: Option<Timestamp>,
    pub config: JsonValue,
}

impl AnnotationSource {
    /// A fresh, active row built from a definition.
    pub fn from_definition(def: &SourceDefinition) -> Self {
        Self {
            source_name: def.source_name.clone(),
            display_name: def.display_name.clone(),
            is_active: true,
            update_frequency_hours: def.update_frequency_hours,
            last_update: None,
            next_update: None,
            config: serde_json::json!({
                "base_url": def.base_url,
                "version": def.version,
            }),
        }
    }

    /// Whether the source is due for refresh at `now`.
    ///
    /// A source that has never run is always due.
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.next_update {
            Some(next) => next <= now,
            None => true,
        }
    }

    /// Compute the `next_update` that follows a completed run at `now`.
    pub fn next_update_after(&self, now: Timestamp) -> Timestamp {
        now + ChronoDuration::hours(self.update_frequency_hours)
    }
}

/// A row of `gene_annotations`: one payload per gene, source and schema
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub gene_id: GeneId,
    pub source: String,
    pub version: String,
    pub annotations: JsonValue,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GeneAnnotation {
    pub fn new(
        gene_id: GeneId,
        source: impl Into<String>,
        version: impl Into<String>,
        annotations: JsonValue,
        now: Timestamp,
    ) -> Self {
        Self {
            gene_id,
            source: source.into(),
            version: version.into(),
            annotations,
            created_at: now,
            updated_at: now,
        }
    }

    /// The `(gene_id, source, version)` uniqueness key.
    pub fn key(&self) -> AnnotationKey {
        AnnotationKey {
            gene_id: self.gene_id,
            source: self.source.clone(),
            version: self.version.clone(),
        }
    }
}

/// Uniqueness key of a `gene_annotations` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotationKey {
    pub gene_id: GeneId,
    pub source: String,
    pub version: String,
}
