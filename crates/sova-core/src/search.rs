//! Web search through the DuckDuckGo HTML endpoint

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
pub const MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

pub struct WebSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl WebSearch {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[async_trait]
impl SearchEngine for WebSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query.trim()));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("search request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("search endpoint returned HTTP {}", status));
        }

        let html = response.text().await?;
        let results = parse_results(&html, MAX_RESULTS);
        tracing::debug!("Search '{}' returned {} result(s)", query, results.len());
        Ok(results)
    }
}

fn collapse_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result links are wrapped in a redirect carrying the target as `uddg`.
fn resolve_link(href: &str) -> String {
    let query = href.split_once('?').map(|(_, q)| q).unwrap_or_default();
    for pair in query.split('&') {
        if let Some(encoded) = pair.strip_prefix("uddg=") {
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return decoded.into_owned();
            }
        }
    }
    if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    }
}

/// Organic results of a result page, ads skipped.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse("div.result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    document
        .select(&result_sel)
        .filter(|result| {
            !result
                .value()
                .classes()
                .any(|class| class == "result--ad")
        })
        .filter_map(|result| {
            let link = result.select(&link_sel).next()?;
            let title = collapse_text(link);
            let url = resolve_link(link.value().attr("href")?);
            if title.is_empty() || url.is_empty() {
                return None;
            }
            let snippet = result
                .select(&snippet_sel)
                .next()
                .map(collapse_text)
                .unwrap_or_default();
            Some(SearchResult {
                title,
                url,
                snippet,
            })
        })
        .take(limit)
        .collect()
}

/// Result list as shown in chat.
pub fn format_results(results: &[SearchResult]) -> String {
    let mut text = String::new();
    for result in results {
        text.push_str(&format!("🔹 {}\n🔗 {}\n", result.title, result.url));
        if !result.snippet.is_empty() {
            text.push_str(&result.snippet);
            text.push('\n');
        }
        text.push('\n');
    }
    text
}

/// Prompt asking the model to answer from the results.
pub fn search_prompt(query: &str, results_text: &str) -> String {
    format!(
        "The user searched the web for: \"{}\".\n\n🔍 Results found:\n{}\nUsing this information, give a detailed answer to the user's question. Cite the sources where useful.",
        query, results_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
<html><body>
<div class="result results_links result--ad">
  <a class="result__a" href="https://ads.example/click">Sponsored</a>
  <a class="result__snippet">Buy now</a>
</div>
<div class="result results_links web-result">
  <h2><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">Rust   Programming
  Language</a></h2>
  <a class="result__snippet" href="#">A language empowering <b>everyone</b>.</a>
</div>
<div class="result results_links web-result">
  <a class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
</div>
<div class="result results_links web-result">
  <a class="result__a" href="https://crates.io/">crates.io</a>
  <a class="result__snippet">Registry</a>
</div>
</body></html>
"##;

    #[test]
    fn parses_organic_results_and_unwraps_redirects() {
        let results = parse_results(PAGE, MAX_RESULTS);
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            SearchResult {
                title: "Rust Programming Language".to_string(),
                url: "https://www.rust-lang.org/".to_string(),
                snippet: "A language empowering everyone.".to_string(),
            }
        );
        assert_eq!(results[1].url, "https://doc.rust-lang.org/book/");
        assert!(results[1].snippet.is_empty());
    }

    #[test]
    fn limit_is_respected() {
        assert_eq!(parse_results(PAGE, 2).len(), 2);
        assert!(parse_results("<html></html>", 5).is_empty());
    }

    #[test]
    fn formats_results_for_chat() {
        let text = format_results(&[SearchResult {
            title: "T".to_string(),
            url: "https://t".to_string(),
            snippet: "S".to_string(),
        }]);
        assert_eq!(text, "🔹 T\n🔗 https://t\nS\n\n");
        assert!(search_prompt("q", &text).contains("\"q\""));
    }

    #[test]
    fn protocol_relative_links_get_https() {
        assert_eq!(resolve_link("//example.com/x"), "https://example.com/x");
    }
}
