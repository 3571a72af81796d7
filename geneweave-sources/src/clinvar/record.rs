//! Normalized ClinVar variant records and their classifications.

use serde::{Deserialize, Serialize};

/// One variant as seen by the accumulator, from either the bulk file or
/// E-utilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub variation_id: u64,
    pub name: String,
    pub variant_type: String,
    pub clinical_significance: String,
    pub review_status: String,
    pub assembly: String,
    pub chromosome: Option<String>,
    pub start: Option<u64>,
    pub stop: Option<u64>,
    pub phenotypes: Vec<String>,
    pub number_submitters: Option<u32>,
    pub last_evaluated: Option<String>,
}

impl VariantRecord {
    pub fn category(&self) -> SignificanceCategory {
        SignificanceCategory::classify(&self.clinical_significance)
    }

    pub fn review_stars(&self) -> u8 {
        review_stars(&self.review_status)
    }

    pub fn consequence(&self) -> Consequence {
        Consequence::from_hgvs(&self.name)
    }

    pub fn protein_position(&self) -> Option<u32> {
        protein_position(&self.name)
    }
}

// ============================================================================
// CLINICAL SIGNIFICANCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignificanceCategory {
    Pathogenic,
    LikelyPathogenic,
    Uncertain,
    LikelyBenign,
    Benign,
    Conflicting,
    Other,
}

impl SignificanceCategory {
    pub const ALL: [SignificanceCategory; 7] = [
        Self::Pathogenic,
        Self::LikelyPathogenic,
        Self::Uncertain,
        Self::LikelyBenign,
        Self::Benign,
        Self::Conflicting,
        Self::Other,
    ];

    pub fn classify(raw: &str) -> Self {
        let s = raw.trim().to_ascii_lowercase();
        if s.contains("conflicting") {
            Self::Conflicting
        } else if s.starts_with("likely pathogenic") {
            Self::LikelyPathogenic
        } else if s.starts_with("pathogenic") {
            Self::Pathogenic
        } else if s.starts_with("uncertain") {
            Self::Uncertain
        } else if s.starts_with("likely benign") {
            Self::LikelyBenign
        } else if s.starts_with("benign") {
            Self::Benign
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pathogenic => "pathogenic",
            Self::LikelyPathogenic => "likely_pathogenic",
            Self::Uncertain => "uncertain",
            Self::LikelyBenign => "likely_benign",
            Self::Benign => "benign",
            Self::Conflicting => "conflicting",
            Self::Other => "other",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_pathogenic(&self) -> bool {
        matches!(self, Self::Pathogenic | Self::LikelyPathogenic)
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Benign | Self::LikelyBenign)
    }
}

/// ClinVar review status mapped to its gold-star rating.
pub fn review_stars(review_status: &str) -> u8 {
    let s = review_status.trim().to_ascii_lowercase();
    if s.contains("practice guideline") {
        4
    } else if s.contains("expert panel") {
        3
    } else if s.contains("multiple submitters") && s.contains("no conflicts") {
        2
    } else if s.contains("single submitter") || s.contains("conflicting") {
        1
    } else {
        0
    }
}

// ============================================================================
// MOLECULAR CONSEQUENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Consequence {
    Nonsense,
    Frameshift,
    Synonymous,
    InframeIndel,
    StartLost,
    Missense,
    SpliceRegion,
    Indel,
    Noncoding,
    Other,
}

impl Consequence {
    /// Best-effort classification from an HGVS variant name such as
    /// `NM_007294.4(BRCA1):c.5266dup (p.Gln1756fs)`.
    pub fn from_hgvs(name: &str) -> Self {
        if let Some(protein) = protein_change(name) {
            if protein.contains("fs") {
                return Self::Frameshift;
            }
            if protein.ends_with("Ter") || protein.ends_with('*') {
                return Self::Nonsense;
            }
            if protein.ends_with('=') {
                return Self::Synonymous;
            }
            if protein.contains("del") || protein.contains("ins") || protein.contains("dup") {
                return Self::InframeIndel;
            }
            let position = protein_position(name);
            if protein.starts_with("Met") && position == Some(1) {
                return Self::StartLost;
            }
            if position.is_some() {
                return Self::Missense;
            }
        }

        let coding = name.split(':').nth(1).unwrap_or("");
        if is_splice_offset(coding) {
            return Self::SpliceRegion;
        }
        if coding.contains("del") || coding.contains("ins") || coding.contains("dup") {
            return Self::Indel;
        }
        if name.starts_with("NR_") || coding.starts_with("n.") {
            return Self::Noncoding;
        }
        Self::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nonsense => "nonsense",
            Self::Frameshift => "frameshift",
            Self::Synonymous => "synonymous",
            Self::InframeIndel => "inframe_indel",
            Self::StartLost => "start_lost",
            Self::Missense => "missense",
            Self::SpliceRegion => "splice_region",
            Self::Indel => "indel",
            Self::Noncoding => "noncoding",
            Self::Other => "other",
        }
    }
}

/// The text inside `(p.` ... `)`, without the `p.` prefix.
fn protein_change(name: &str) -> Option<&str> {
    let start = name.find("(p.")? + 3;
    let rest = &name[start..];
    let end = rest.find(')').unwrap_or(rest.len());
    let change = rest[..end].trim();
    (!change.is_empty()).then_some(change)
}

/// `c.123+1G>A` or `c.124-2A>G`: an intronic offset next to a splice site.
fn is_splice_offset(coding: &str) -> bool {
    let Some(body) = coding.trim().strip_prefix("c.") else {
        return false;
    };
    let bytes = body.as_bytes();
    bytes.windows(2).enumerate().any(|(i, w)| {
        (w[0] == b'+' || w[0] == b'-') && w[1].is_ascii_digit() && i > 0 && bytes[i - 1].is_ascii_digit()
    })
}

/// Residue number of a protein change, e.g. `p.Arg1443Ter` gives 1443.
pub fn protein_position(name: &str) -> Option<u32> {
    let change = protein_change(name)?;
    let digits: String = change
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|p| *p > 0)
}

/// Genome build preference: GRCh38 over GRCh37 over anything else.
pub fn build_priority(assembly: &str) -> u8 {
    match assembly.trim() {
        "GRCh38" => 2,
        "GRCh37" => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance_categories() {
        use SignificanceCategory::*;
        let cases = [
            ("Pathogenic", Pathogenic),
            ("Pathogenic/Likely pathogenic", Pathogenic),
            ("Likely pathogenic", LikelyPathogenic),
            ("Uncertain significance", Uncertain),
            ("Likely benign", LikelyBenign),
            ("Benign/Likely benign", Benign),
            ("Conflicting classifications of pathogenicity", Conflicting),
            ("Conflicting interpretations of pathogenicity", Conflicting),
            ("not provided", Other),
            ("", Other),
        ];
        for (raw, expected) in cases {
            assert_eq!(SignificanceCategory::classify(raw), expected, "{}", raw);
        }
    }

    #[test]
    fn test_review_stars() {
        assert_eq!(review_stars("practice guideline"), 4);
        assert_eq!(review_stars("reviewed by expert panel"), 3);
        assert_eq!(review_stars("criteria provided, multiple submitters, no conflicts"), 2);
        assert_eq!(review_stars("criteria provided, single submitter"), 1);
        assert_eq!(review_stars("criteria provided, conflicting classifications"), 1);
        assert_eq!(review_stars("no assertion criteria provided"), 0);
    }

    #[test]
    fn test_consequences() {
        use Consequence::*;
        let cases = [
            ("NM_007294.4(BRCA1):c.4327C>T (p.Arg1443Ter)", Nonsense),
            ("NM_007294.4(BRCA1):c.5266dup (p.Gln1756fs)", Frameshift),
            ("NM_007294.4(BRCA1):c.68_69del (p.Glu23fsTer17)", Frameshift),
            ("NM_000546.6(TP53):c.30C>G (p.Met10Ile)", Missense),
            ("NM_000546.6(TP53):c.215C>G (p.Pro72Arg)", Missense),
            ("NM_000546.6(TP53):c.639A>G (p.Arg213=)", Synonymous),
            ("NM_000492.4(CFTR):c.1521_1523del (p.Phe508del)", InframeIndel),
            ("NM_000546.6(TP53):c.1A>G (p.Met1Val)", StartLost),
            ("NM_007294.4(BRCA1):c.5277+1G>A", SpliceRegion),
            ("NM_007294.4(BRCA1):c.4185+3_4185+6del", SpliceRegion),
            ("NM_007294.4(BRCA1):c.-19_80del", Indel),
            ("NR_027676.2(BRCA1):n.100A>G", Noncoding),
            ("GRCh38/hg38 17q21.31(chr17:43044295-43125483)x1", Other),
        ];
        for (name, expected) in cases {
            assert_eq!(Consequence::from_hgvs(name), expected, "{}", name);
        }
    }

    #[test]
    fn test_protein_position() {
        assert_eq!(protein_position("NM_007294.4(BRCA1):c.4327C>T (p.Arg1443Ter)"), Some(1443));
        assert_eq!(protein_position("NM_007294.4(BRCA1):c.5277+1G>A"), None);
        assert_eq!(protein_position("x (p.?)"), None);
    }

    #[test]
    fn test_build_priority() {
        assert!(build_priority("GRCh38") > build_priority("GRCh37"));
        assert!(build_priority("GRCh37") > build_priority("na"));
    }
}
