//! RETS response parsing.
//!
//! The server speaks three text grammars: the login capability list, COMPACT
//! metadata (`<COLUMNS>`/`<DATA>` inside a `<METADATA-X>` block), and COMPACT
//! search results. All three ride inside a loose XML envelope that real
//! servers emit with enough variation that a conforming XML parser is the
//! wrong tool; matching is regex-driven and tolerates missing optional
//! elements. A response carrying neither ReplyCode nor ReplyText is rejected
//! as malformed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::RetsError;

static REPLY_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"ReplyCode="([^"]*)""#).expect("reply code regex"));
static REPLY_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"ReplyText="([^"]*)""#).expect("reply text regex"));
static RETS_RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<RETS-RESPONSE>(.*?)</RETS-RESPONSE>").expect("rets-response regex")
});
static METADATA_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<METADATA-([A-Z_]+)([^>]*)>").expect("metadata open regex"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z]+)="([^"]*)""#).expect("attr regex"));
static COLUMNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<COLUMNS>(.*?)</COLUMNS>").expect("columns regex"));
static DATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<DATA>(.*?)</DATA>").expect("data regex"));
static COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<COUNT\s+Records="(\d+)""#).expect("count regex"));
static UNAUTHORIZED_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"class \[([^\]]+)\] in resource \[([^\]]+)\]").expect("unauthorized regex")
});

/// Reply code the server uses for queries the account is not entitled to.
pub const REPLY_UNAUTHORIZED_QUERY: i64 = 20207;

/// Shared envelope fields present on every response shape.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: i64,
    pub text: String,
}

impl Reply {
    /// Extract ReplyCode/ReplyText from the envelope. Failing to find either
    /// attribute anywhere in the body is the parser's only fatal condition.
    fn extract(body: &str) -> Result<Reply, RetsError> {
        let code = REPLY_CODE_RE.captures(body).map(|c| c[1].to_string());
        let text = REPLY_TEXT_RE.captures(body).map(|c| c[1].to_string());
        if code.is_none() && text.is_none() {
            return Err(RetsError::Malformed(
                "response carries neither ReplyCode nor ReplyText".to_string(),
            ));
        }
        Ok(Reply {
            code: code.and_then(|c| c.parse().ok()).unwrap_or(0),
            text: text.unwrap_or_default(),
        })
    }

    /// Classifies a non-zero reply, distinguishing the unauthorized-query
    /// signature that callers treat as a lockout signal.
    pub fn as_error(&self) -> Option<RetsError> {
        if self.code == 0 {
            return None;
        }
        if self.code == REPLY_UNAUTHORIZED_QUERY && self.text.contains("Unauthorized Query") {
            if let Some(caps) = UNAUTHORIZED_PAIR_RE.captures(&self.text) {
                return Some(RetsError::UnauthorizedQuery {
                    class: caps[1].to_string(),
                    resource: caps[2].to_string(),
                });
            }
        }
        Some(RetsError::Protocol {
            reply_code: self.code,
            reply_text: self.text.clone(),
        })
    }
}

/// Parsed login body: reply plus the capability-name → URL table.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub reply: Reply,
    pub capabilities: HashMap<String, String>,
}

/// Parse the login response. Capability lines are `KEY=VALUE`; keys starting
/// with `Info` describe the account rather than an endpoint and are skipped.
pub fn parse_login(body: &str) -> Result<LoginResponse, RetsError> {
    let reply = Reply::extract(body)?;

    let mut capabilities = HashMap::new();
    if let Some(caps) = RETS_RESPONSE_RE.captures(body) {
        for line in caps[1].lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.starts_with("Info") {
                    continue;
                }
                capabilities.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    Ok(LoginResponse {
        reply,
        capabilities,
    })
}

/// A COMPACT table: column names plus positionally aligned rows.
#[derive(Debug, Clone, Default)]
pub struct CompactTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CompactTable {
    /// Value of `column` in row `index`, or `""` when the column is unknown.
    pub fn get(&self, index: usize, column: &str) -> &str {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|pos| self.rows.get(index).and_then(|row| row.get(pos)))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Rows materialized as column-name → value maps.
    pub fn records(&self) -> Vec<HashMap<String, String>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Parsed `<METADATA-X>` response.
#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub reply: Reply,
    /// The `X` of `<METADATA-X>`, e.g. `RESOURCE`, `CLASS`, `TABLE`, `LOOKUP_TYPE`.
    pub metadata_type: String,
    /// Attributes on the metadata block (`Resource`, `Class`, `Version`, ...).
    pub attrs: HashMap<String, String>,
    pub table: CompactTable,
}

/// Parse a COMPACT metadata response.
pub fn parse_metadata(body: &str) -> Result<MetadataResponse, RetsError> {
    let reply = Reply::extract(body)?;

    let (metadata_type, attrs) = match METADATA_OPEN_RE.captures(body) {
        Some(caps) => {
            let attrs = ATTR_RE
                .captures_iter(&caps[2])
                .map(|a| (a[1].to_string(), a[2].to_string()))
                .collect();
            (caps[1].to_string(), attrs)
        }
        None => (String::new(), HashMap::new()),
    };

    Ok(MetadataResponse {
        reply,
        metadata_type,
        attrs,
        table: extract_table(body),
    })
}

/// Parsed COMPACT search result.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub reply: Reply,
    /// `<COUNT Records="...">` when the query asked for Count=1.
    pub count: Option<u64>,
    pub table: CompactTable,
}

/// Parse a COMPACT search response.
pub fn parse_search(body: &str) -> Result<SearchResponse, RetsError> {
    let reply = Reply::extract(body)?;
    let count = COUNT_RE
        .captures(body)
        .and_then(|c| c[1].parse().ok());

    Ok(SearchResponse {
        reply,
        count,
        table: extract_table(body),
    })
}

fn extract_table(body: &str) -> CompactTable {
    let columns = match COLUMNS_RE.captures(body) {
        Some(caps) => split_compact(&caps[1]),
        None => return CompactTable::default(),
    };

    let rows = DATA_RE
        .captures_iter(body)
        .map(|caps| {
            let mut row = split_compact(&caps[1]);
            // Rows shorter than the header are right-padded so positional
            // access never misaligns.
            while row.len() < columns.len() {
                row.push(String::new());
            }
            row
        })
        .collect();

    CompactTable { columns, rows }
}

/// Split one COMPACT line. The delimiter is exclusively the tab character;
/// the framing tabs at both ends are stripped and every segment is trimmed.
fn split_compact(line: &str) -> Vec<String> {
    line.trim()
        .split('\t')
        .map(|segment| segment.trim().to_string())
        .collect()
}
