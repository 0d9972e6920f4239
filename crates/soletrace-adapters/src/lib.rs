//! Document parsers for the remote marketplace: listing grids, ld+json
//! product blocks, activity JSON, the proxy provider table, and the links
//! CSV row codec.
//!
//! Everything here is a pure function over an already-fetched body. The
//! pipeline treats any error from this crate as one more retryable fault.

use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use soletrace_core::ProxyEndpoint;
use thiserror::Error;

pub const CRATE_NAME: &str = "soletrace-adapters";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("listing grid not found in page")]
    MissingListingGrid,
    #[error("no ld+json product block in page")]
    MissingProductJson,
    #[error("product block has no sku field")]
    MissingSku,
    #[error("malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid selector {0}")]
    Selector(String),
}

fn sel(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::Selector(format!("{selector}: {e:?}")))
}

/// Product link paths from a brand browse page: every anchor inside the
/// `browse-grid` container, de-duplicated in first-seen order. A page with
/// the grid present but no anchors parses to an empty list — that is a
/// legitimate tail page, not a fault. A page without the grid at all is a
/// fault: it is what a proxy error page or blocked response looks like.
pub fn extract_listing_links(html: &str) -> Result<Vec<String>, ParseError> {
    let document = Html::parse_document(html);
    let grid = sel("div.browse-grid")?;
    let anchors = sel("a[href]")?;

    let grid = document
        .select(&grid)
        .next()
        .ok_or(ParseError::MissingListingGrid)?;

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for anchor in grid.select(&anchors) {
        if let Some(href) = anchor.value().attr("href") {
            if seen.insert(href) {
                links.push(href.to_string());
            }
        }
    }
    Ok(links)
}

/// The structural handoff from a product detail page: the full ld+json
/// document plus the one field the pipeline itself needs, the style SKU.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductDetail {
    pub sku: String,
    pub document: JsonValue,
}

/// Product document from a detail page. The page carries several ld+json
/// blocks; the product one is last. A missing block, unparseable JSON, or
/// an absent/empty `sku` are all structural faults.
pub fn extract_product_detail(html: &str) -> Result<ProductDetail, ParseError> {
    let document = Html::parse_document(html);
    let blocks = sel(r#"script[type="application/ld+json"]"#)?;

    let block = document
        .select(&blocks)
        .last()
        .ok_or(ParseError::MissingProductJson)?;
    let text = block.text().collect::<String>();
    let value: JsonValue = serde_json::from_str(text.trim())?;

    let sku = value
        .get("sku")
        .and_then(JsonValue::as_str)
        .filter(|sku| !sku.is_empty())
        .ok_or(ParseError::MissingSku)?
        .to_string();

    Ok(ProductDetail {
        sku,
        document: value,
    })
}

/// Canonical product URL recorded inside a detail document (`offers.url`).
/// The enumerator uses it to map persisted detail artifacts back to the
/// listing links they came from.
pub fn detail_canonical_url(document: &JsonValue) -> Option<&str> {
    document.get("offers")?.get("url")?.as_str()
}

/// Activity responses are persisted opaquely; the only contract is that the
/// body is JSON at all.
pub fn parse_activity_document(body: &str) -> Result<JsonValue, ParseError> {
    Ok(serde_json::from_str(body)?)
}

/// Proxy endpoints from the provider's listing page: one table row per
/// endpoint, host in the first cell, port in the second. Rows that do not
/// parse are skipped; deciding whether the remainder is usable is the
/// pool's job.
pub fn extract_proxy_endpoints(html: &str) -> Result<Vec<ProxyEndpoint>, ParseError> {
    let document = Html::parse_document(html);
    let rows = sel("table#proxylisttable tbody tr")?;
    let cells = sel("td")?;

    let mut endpoints = Vec::new();
    for row in document.select(&rows) {
        let mut cells = row.select(&cells);
        let (Some(host_cell), Some(port_cell)) = (cells.next(), cells.next()) else {
            continue;
        };
        let host = host_cell.text().collect::<String>().trim().to_string();
        if host.is_empty() {
            continue;
        }
        let Ok(port) = port_cell.text().collect::<String>().trim().parse::<u16>() else {
            continue;
        };
        endpoints.push(ProxyEndpoint::new(host, port));
    }
    Ok(endpoints)
}

/// Serialize link paths as a single CSV record, every field quoted, CRLF
/// terminated — the exact format the downstream jobs consume.
pub fn links_to_csv_row(links: &[String]) -> String {
    let mut row = String::new();
    for (i, link) in links.iter().enumerate() {
        if i > 0 {
            row.push(',');
        }
        row.push('"');
        row.push_str(&link.replace('"', "\"\""));
        row.push('"');
    }
    row.push_str("\r\n");
    row
}

/// Parse every record in a links CSV document and flatten the fields.
/// Tolerates quoted and bare fields, doubled-quote escapes, and either line
/// ending; empty fields are dropped.
pub fn links_from_csv(text: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' {
            in_quotes = true;
            field_started = true;
        } else if ch == ',' {
            fields.push(std::mem::take(&mut current));
            field_started = true;
        } else if ch == '\r' || ch == '\n' {
            if field_started || !current.is_empty() {
                fields.push(std::mem::take(&mut current));
            }
            field_started = false;
        } else {
            current.push(ch);
            field_started = true;
        }
    }
    if field_started || !current.is_empty() {
        fields.push(current);
    }

    fields.retain(|field| !field.is_empty());
    fields
}
