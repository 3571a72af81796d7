//! Two-pass streaming aggregation over `variant_summary`.
//!
//! Pass one records, per target gene, only the winning genome build for
//! each variation id. Pass two parses just the winning rows into the gene
//! accumulators, consuming each dedup entry so a (gene, variant) pair is
//! aggregated once. Memory is bounded by the dedup map (integers only) and
//! the capped accumulators, not by the row count.

use super::accumulator::{AccumulatorCaps, GeneAccumulator};
use super::record::{build_priority, VariantRecord};
use flate2::read::MultiGzDecoder;
use geneweave_core::GeneId;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Header-mapped column positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    variation_id: usize,
    gene_symbol: usize,
    assembly: usize,
    significance: usize,
    name: Option<usize>,
    variant_type: Option<usize>,
    review_status: Option<usize>,
    phenotypes: Option<usize>,
    chromosome: Option<usize>,
    start: Option<usize>,
    stop: Option<usize>,
    submitters: Option<usize>,
    last_evaluated: Option<usize>,
}

impl ColumnMap {
    /// Map a tab-delimited header. Newer dumps renamed the significance
    /// column, so both spellings are accepted.
    pub fn from_header(header: &str) -> Result<Self, String> {
        let columns: Vec<&str> = header
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .map(|c| c.trim().trim_start_matches('#'))
            .collect();
        let find = |names: &[&str]| columns.iter().position(|c| names.contains(c));
        let require = |names: &[&str]| find(names).ok_or_else(|| format!("missing column {}", names[0]));

        Ok(Self {
            variation_id: require(&["VariationID"])?,
            gene_symbol: require(&["GeneSymbol"])?,
            assembly: require(&["Assembly"])?,
            significance: require(&["ClinicalSignificance", "GermlineClassification"])?,
            name: find(&["Name"]),
            variant_type: find(&["Type"]),
            review_status: find(&["ReviewStatus", "GermlineReviewStatus"]),
            phenotypes: find(&["PhenotypeList"]),
            chromosome: find(&["Chromosome"]),
            start: find(&["Start"]),
            stop: find(&["Stop"]),
            submitters: find(&["NumberSubmitters"]),
            last_evaluated: find(&["LastEvaluated", "GermlineDateLastEvaluated"]),
        })
    }

    fn key_fields<'a>(&self, fields: &[&'a str]) -> Option<(u64, &'a str, u8)> {
        let vid = fields.get(self.variation_id)?.trim().parse().ok()?;
        let symbols = *fields.get(self.gene_symbol)?;
        let priority = build_priority(fields.get(self.assembly).copied().unwrap_or(""));
        Some((vid, symbols, priority))
    }

    fn record(&self, fields: &[&str], variation_id: u64) -> VariantRecord {
        let text = |idx: Option<usize>| -> String {
            idx.and_then(|i| fields.get(i))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty() && *s != "-")
                .unwrap_or("")
                .to_string()
        };
        let opt = |idx: Option<usize>| Some(text(idx)).filter(|s| !s.is_empty());
        VariantRecord {
            variation_id,
            name: text(self.name),
            variant_type: text(self.variant_type),
            clinical_significance: text(Some(self.significance)),
            review_status: text(self.review_status),
            assembly: text(Some(self.assembly)),
            chromosome: opt(self.chromosome),
            start: opt(self.start).and_then(|s| s.parse().ok()),
            stop: opt(self.stop).and_then(|s| s.parse().ok()),
            phenotypes: split_phenotypes(&text(self.phenotypes)),
            number_submitters: opt(self.submitters).and_then(|s| s.parse().ok()),
            last_evaluated: opt(self.last_evaluated),
        }
    }
}

fn split_phenotypes(raw: &str) -> Vec<String> {
    raw.split(['|', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn gene_symbols(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|s| !s.is_empty() && *s != "-")
}

/// Counters describing one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub rows_scanned: u64,
    pub rows_matched: u64,
    pub unique_variants: u64,
    pub duplicate_rows_skipped: u64,
    pub malformed_rows: u64,
    pub genes_with_data: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationOutput {
    pub annotations: HashMap<GeneId, JsonValue>,
    pub stats: AggregationStats,
}

/// Run both passes over the file produced by `open`.
///
/// `open` is called once per pass. `targets` maps gene symbols to gene
/// ids; rows for other genes are skipped without parsing.
pub fn two_pass_aggregate<R, F>(
    open: F,
    targets: &HashMap<String, GeneId>,
    caps: AccumulatorCaps,
) -> io::Result<AggregationOutput>
where
    R: BufRead,
    F: Fn() -> io::Result<R>,
{
    let mut stats = AggregationStats::default();

    // pass 1: {gene -> {variation_id -> best build priority}}
    let mut reader = open()?;
    let columns = read_header(&mut reader)?;
    let mut winners: HashMap<GeneId, HashMap<u64, u8>> = HashMap::new();
    let mut line = String::new();
    while read_row(&mut reader, &mut line)? {
        stats.rows_scanned += 1;
        let fields: Vec<&str> = line.split('\t').collect();
        let Some((vid, symbols, priority)) = columns.key_fields(&fields) else {
            stats.malformed_rows += 1;
            continue;
        };
        for symbol in gene_symbols(symbols) {
            if let Some(&gene_id) = targets.get(symbol) {
                let best = winners.entry(gene_id).or_default().entry(vid).or_insert(priority);
                *best = (*best).max(priority);
            }
        }
    }
    stats.unique_variants = winners.values().map(|v| v.len() as u64).sum();

    // pass 2: aggregate each winning row once
    let mut reader = open()?;
    read_header(&mut reader)?;
    let mut accumulators: HashMap<GeneId, GeneAccumulator> = HashMap::new();
    while read_row(&mut reader, &mut line)? {
        let fields: Vec<&str> = line.split('\t').collect();
        let Some((vid, symbols, priority)) = columns.key_fields(&fields) else {
            continue;
        };
        let mut parsed: Option<VariantRecord> = None;
        for symbol in gene_symbols(symbols) {
            let Some(&gene_id) = targets.get(symbol) else {
                continue;
            };
            let Some(pending) = winners.get_mut(&gene_id) else {
                continue;
            };
            if pending.get(&vid) != Some(&priority) {
                stats.duplicate_rows_skipped += 1;
                continue;
            }
            pending.remove(&vid);
            stats.rows_matched += 1;
            let record = parsed.get_or_insert_with(|| columns.record(&fields, vid));
            accumulators
                .entry(gene_id)
                .or_insert_with(|| GeneAccumulator::new(caps))
                .add(record);
        }
    }

    let annotations: HashMap<GeneId, JsonValue> = accumulators
        .into_iter()
        .map(|(gene_id, acc)| (gene_id, acc.finalize()))
        .collect();
    stats.genes_with_data = annotations.len();

    Ok(AggregationOutput { annotations, stats })
}

fn read_header<R: BufRead>(reader: &mut R) -> io::Result<ColumnMap> {
    let mut header = String::new();
    if reader.read_line(&mut header)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty variant file"));
    }
    ColumnMap::from_header(&header).map_err(|reason| io::Error::new(io::ErrorKind::InvalidData, reason))
}

fn read_row<R: BufRead>(reader: &mut R, line: &mut String) -> io::Result<bool> {
    loop {
        line.clear();
        if reader.read_line(line)? == 0 {
            return Ok(false);
        }
        let trimmed_len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed_len);
        if !line.is_empty() {
            return Ok(true);
        }
    }
}

/// Open a variant file, decompressing when the name ends in `.gz`.
pub fn open_variant_file(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let gz = path.extension().is_some_and(|ext| ext == "gz");
    Ok(if gz {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "#AlleleID\tType\tName\tGeneID\tGeneSymbol\tClinicalSignificance\tLastEvaluated\tPhenotypeList\tAssembly\tChromosome\tStart\tStop\tReviewStatus\tNumberSubmitters\tVariationID";

    fn row(vid: u64, symbol: &str, significance: &str, assembly: &str, name: &str) -> String {
        format!(
            "1\tsingle nucleotide variant\t{name}\t672\t{symbol}\t{significance}\tJan 01, 2024\tBreast cancer\t{assembly}\t17\t100\t100\tcriteria provided, single submitter\t1\t{vid}"
        )
    }

    fn run(body: &str, targets: &[(&str, GeneId)], caps: AccumulatorCaps) -> AggregationOutput {
        let targets: HashMap<String, GeneId> = targets.iter().map(|(s, id)| (s.to_string(), *id)).collect();
        let text = format!("{}\n{}\n", HEADER, body);
        two_pass_aggregate(|| Ok(Cursor::new(text.clone().into_bytes())), &targets, caps).unwrap()
    }

    #[test]
    fn test_grch38_row_wins_and_variants_are_unique() {
        let body = [
            row(42, "G1", "Benign", "GRCh37", "NM_1(G1):c.1A>G (p.Met1Val)"),
            row(42, "G1", "Pathogenic", "GRCh38", "NM_1(G1):c.100C>T (p.Arg34Ter)"),
            row(43, "G1", "Uncertain significance", "GRCh38", "NM_1(G1):c.200C>G (p.Pro67Arg)"),
        ]
        .join("\n");
        let out = run(&body, &[("G1", 1)], AccumulatorCaps::default());

        let g1 = &out.annotations[&1];
        assert_eq!(g1["total_variants"], 2);
        assert_eq!(g1["pathogenic_count"], 1);
        assert_eq!(g1["benign_count"], 0);
        assert_eq!(g1["vus_count"], 1);
        assert_eq!(g1["pathogenic_variants"][0]["name"], "NM_1(G1):c.100C>T (p.Arg34Ter)");
        assert_eq!(out.stats.unique_variants, 2);
        assert_eq!(out.stats.duplicate_rows_skipped, 1);
    }

    #[test]
    fn test_repeated_winning_row_counts_once() {
        let body = [
            row(7, "G1", "Pathogenic", "GRCh38", "x (p.Arg1Ter)"),
            row(7, "G1", "Pathogenic", "GRCh38", "x (p.Arg1Ter)"),
        ]
        .join("\n");
        let out = run(&body, &[("G1", 1)], AccumulatorCaps::default());
        assert_eq!(out.annotations[&1]["total_variants"], 1);
    }

    #[test]
    fn test_multi_gene_rows_and_untargeted_genes() {
        let body = [
            row(1, "G1;G2", "Benign", "GRCh38", "x"),
            row(2, "OTHER", "Pathogenic", "GRCh38", "x"),
            row(3, "-", "Pathogenic", "GRCh38", "x"),
        ]
        .join("\n");
        let out = run(&body, &[("G1", 1), ("G2", 2)], AccumulatorCaps::default());
        assert_eq!(out.annotations.len(), 2);
        assert_eq!(out.annotations[&1]["total_variants"], 1);
        assert_eq!(out.annotations[&2]["total_variants"], 1);
        assert_eq!(out.stats.rows_scanned, 3);
    }

    #[test]
    fn test_malformed_rows_are_counted() {
        let body = format!("{}\nnot\ta\trow\n", row(1, "G1", "Benign", "GRCh38", "x"));
        let out = run(&body, &[("G1", 1)], AccumulatorCaps::default());
        assert_eq!(out.stats.malformed_rows, 1);
        assert_eq!(out.annotations[&1]["total_variants"], 1);
    }

    #[test]
    fn test_missing_required_column_fails() {
        let targets = HashMap::new();
        let result = two_pass_aggregate(
            || Ok(Cursor::new(b"GeneSymbol\tAssembly\n".to_vec())),
            &targets,
            AccumulatorCaps::default(),
        );
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_germline_classification_header() {
        let header = "#AlleleID\tType\tName\tGeneSymbol\tGermlineClassification\tAssembly\tVariationID";
        let map = ColumnMap::from_header(header).unwrap();
        assert_eq!(map.significance, 4);
        assert_eq!(map.variation_id, 6);
    }

    #[test]
    fn test_detail_lists_stay_bounded_as_rows_grow() {
        let caps = AccumulatorCaps { detail_cap: 5, condition_cap: 3 };
        for scale in [10u64, 100] {
            let body: Vec<String> = (0..20 * scale)
                .map(|i| row(i, "G1", "Pathogenic", "GRCh38", &format!("x (p.Arg{}Ter)", i + 1)))
                .collect();
            let out = run(&body.join("\n"), &[("G1", 1)], caps);
            let g1 = &out.annotations[&1];
            assert_eq!(g1["total_variants"], 20 * scale);
            assert!(g1["pathogenic_variants"].as_array().unwrap().len() <= 5);
            assert!(g1["protein_positions"].as_array().unwrap().len() <= 5);
            assert!(g1["top_conditions"].as_array().unwrap().len() <= 3);
        }
    }
}
