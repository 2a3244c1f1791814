//! FT.CREATE argument parsing into a schema builder. Tokenizer-level
//! options (LANGUAGE, SCORE, offsets, stopwords, stemming) belong to the
//! ingestion side; they are validated and recorded but do not shape the
//! query path.

use fletch::index::{DistanceMetric, VectorKind};
use fletch::{config, DataType, IndexSchema, IndexSchemaBuilder, Result, UserError};

use crate::commands::args::ArgsIterator;

fn syntax(message: impl Into<String>) -> fletch::Error {
    UserError::InvalidQuerySyntax(message.into()).into()
}

/// Parses everything after `FT.CREATE <name>`.
pub fn parse_create(name: &str, args: &[Vec<u8>]) -> Result<IndexSchema> {
    let mut itr = ArgsIterator::new(args);
    let mut builder = IndexSchema::builder(name);

    loop {
        if itr.match_keyword("ON") {
            let data_type = itr.next_str()?;
            builder = if data_type.eq_ignore_ascii_case("HASH") {
                builder.data_type(DataType::Hash)
            } else if data_type.eq_ignore_ascii_case("JSON") {
                builder.data_type(DataType::Json)
            } else {
                return Err(syntax(format!("Unknown data type `{data_type}`")));
            };
        } else if itr.match_keyword("PREFIX") {
            let count = itr.next_usize("PREFIX count")?;
            if count as u64 > config::MAX_PREFIXES.get() {
                return Err(syntax("Too many key prefixes for this schema"));
            }
            for _ in 0..count {
                builder = builder.key_prefix(itr.next_str()?);
            }
        } else if itr.match_keyword("LANGUAGE") {
            itr.next_str()?;
        } else if itr.match_keyword("SCORE") {
            let score = itr.next_str()?;
            let parsed: f64 = score
                .parse()
                .map_err(|_| syntax(format!("Invalid SCORE `{score}`")))?;
            if !(0.0..=1.0).contains(&parsed) {
                return Err(syntax("SCORE must be within [0.0, 1.0]"));
            }
        } else if itr.match_keyword("NOOFFSETS")
            || itr.match_keyword("WITHOFFSETS")
            || itr.match_keyword("NOSTEM")
        {
            // ingestion-side toggles
        } else if itr.match_keyword("STOPWORDS") {
            let count = itr.next_usize("STOPWORDS count")?;
            for _ in 0..count {
                itr.next_str()?;
            }
        } else if itr.match_keyword("SCHEMA") {
            break;
        } else {
            return Err(syntax(format!(
                "Expected `SCHEMA` at position {}",
                itr.position() + 1
            )));
        }
    }

    let mut fields = 0;
    while !itr.done() {
        let identifier = itr.next_str()?;
        let alias =
            if itr.match_keyword("AS") { itr.next_str()?.to_string() } else { identifier.to_string() };
        if itr.match_keyword("NUMERIC") {
            builder = builder.numeric(&alias, identifier)?;
        } else if itr.match_keyword("TAG") {
            let mut separator = ',';
            let mut case_sensitive = false;
            loop {
                if itr.match_keyword("SEPARATOR") {
                    let sep = itr.next_str()?;
                    let mut chars = sep.chars();
                    separator = match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => return Err(syntax("SEPARATOR must be a single character")),
                    };
                } else if itr.match_keyword("CASESENSITIVE") {
                    case_sensitive = true;
                } else {
                    break;
                }
            }
            builder = builder.tag(&alias, identifier, separator, case_sensitive)?;
        } else if itr.match_keyword("TEXT") {
            // WEIGHT and NOSTEM are indexing-time concerns
            loop {
                if itr.match_keyword("WEIGHT") {
                    itr.next_str()?;
                } else if itr.match_keyword("NOSTEM") {
                } else {
                    break;
                }
            }
            builder = builder.text(&alias, identifier)?;
        } else if itr.match_keyword("VECTOR") {
            builder = parse_vector_field(builder, &alias, identifier, &mut itr)?;
        } else {
            return Err(syntax(format!(
                "Unknown field type at position {}",
                itr.position() + 1
            )));
        }
        fields += 1;
    }
    if fields == 0 {
        return Err(syntax("SCHEMA requires at least one field"));
    }
    builder.build()
}

fn parse_vector_field(
    builder: IndexSchemaBuilder,
    alias: &str,
    identifier: &str,
    itr: &mut ArgsIterator,
) -> Result<IndexSchemaBuilder> {
    let algorithm = itr.next_str()?;
    let kind = if algorithm.eq_ignore_ascii_case("FLAT") {
        VectorKind::Flat
    } else if algorithm.eq_ignore_ascii_case("HNSW") {
        VectorKind::Hnsw
    } else {
        return Err(syntax(format!("Unknown vector algorithm `{algorithm}`")));
    };
    let attribute_count = itr.next_usize("VECTOR attribute count")?;
    if attribute_count % 2 != 0 {
        return Err(syntax("VECTOR attribute count must be even"));
    }
    let mut dimensions = None;
    let mut metric = None;
    let mut remaining = attribute_count;
    while remaining > 0 {
        let key = itr.next_str()?;
        let value = itr.next_str()?;
        remaining -= 2;
        if key.eq_ignore_ascii_case("TYPE") {
            if !value.eq_ignore_ascii_case("FLOAT32") {
                return Err(syntax(format!("Unsupported vector type `{value}`")));
            }
        } else if key.eq_ignore_ascii_case("DIM") {
            let dim: usize =
                value.parse().map_err(|_| syntax("DIM must be a positive integer"))?;
            dimensions = Some(dim);
        } else if key.eq_ignore_ascii_case("DISTANCE_METRIC") {
            metric = Some(if value.eq_ignore_ascii_case("L2") {
                DistanceMetric::L2
            } else if value.eq_ignore_ascii_case("IP") {
                DistanceMetric::InnerProduct
            } else if value.eq_ignore_ascii_case("COSINE") {
                DistanceMetric::Cosine
            } else {
                return Err(syntax(format!("Unknown distance metric `{value}`")));
            });
        } else if key.eq_ignore_ascii_case("INITIAL_CAP") || key.eq_ignore_ascii_case("BLOCK_SIZE")
        {
            value.parse::<u64>().map_err(|_| syntax(format!("Invalid `{key}` value")))?;
        } else if key.eq_ignore_ascii_case("M") {
            let m: u64 = value.parse().map_err(|_| syntax("Invalid `M` value"))?;
            if m > config::MAX_VECTOR_M.get() {
                return Err(syntax("`M` exceeds the configured maximum"));
            }
        } else if key.eq_ignore_ascii_case("EF_CONSTRUCTION") {
            let ef: u64 = value.parse().map_err(|_| syntax("Invalid `EF_CONSTRUCTION`"))?;
            if ef > config::MAX_VECTOR_EF_CONSTRUCTION.get() {
                return Err(syntax("`EF_CONSTRUCTION` exceeds the configured maximum"));
            }
        } else if key.eq_ignore_ascii_case("EF_RUNTIME") {
            let ef: u64 = value.parse().map_err(|_| syntax("Invalid `EF_RUNTIME`"))?;
            if ef > config::MAX_VECTOR_EF_RUNTIME.get() {
                return Err(syntax("`EF_RUNTIME` exceeds the configured maximum"));
            }
        } else {
            return Err(syntax(format!("Unknown vector attribute `{key}`")));
        }
    }
    let dimensions = dimensions.ok_or_else(|| syntax("VECTOR requires `DIM`"))?;
    let metric = metric.ok_or_else(|| syntax("VECTOR requires `DISTANCE_METRIC`"))?;
    builder.vector(alias, identifier, kind, dimensions, metric)
}
