// Stage Pipeline
// Seam between the orchestrator and the external collaborators that do
// the actual fetching, scoring, and rendering. The orchestrator drives
// phases and owns progress/cancellation; implementations own the I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_types::{ChartData, Signal};

use crate::error::Result;

/// Structured reading of the user's query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentInfo {
    /// One-line restatement of what the user is after
    pub focus: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Search queries to run in the active-search phase
    #[serde(default)]
    pub search_queries: Vec<String>,
}

/// One news item as fetched from a source or search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub news_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Source-reported heat/rank, higher is hotter
    #[serde(default)]
    pub heat: f64,
}

/// External collaborators for each phase. All methods are fallible; the
/// orchestrator decides which failures are fatal and which are absorbed.
#[async_trait]
pub trait StagePipeline: Send + Sync {
    /// Reads the user query into focus, keywords, and search queries
    async fn interpret_intent(&self, query: &str) -> Result<IntentInfo>;

    /// Fetches up to `wide` hot items from one named source
    async fn fetch_source(&self, source: &str, wide: u32) -> Result<Vec<NewsItem>>;

    /// Runs one active search query
    async fn search(&self, query: &str) -> Result<Vec<NewsItem>>;

    /// Refreshes market sentiment context; returns the number of series touched
    async fn refresh_sentiment(&self) -> Result<usize>;

    /// Recent stored items to merge into this run's working set
    async fn stored_backlog(&self) -> Result<Vec<NewsItem>>;

    /// Keeps only items judged worth deep analysis
    async fn filter_high_value(
        &self,
        items: Vec<NewsItem>,
        intent: Option<&IntentInfo>,
    ) -> Result<Vec<NewsItem>>;

    /// Deep-analyzes one item. `Ok(None)` means the item produced no signal,
    /// which is a normal outcome, not a failure.
    async fn analyze_item(&self, item: &NewsItem, intent: Option<&IntentInfo>)
        -> Result<Option<Signal>>;

    /// Price history and prediction for one ticker a signal names
    async fn chart_for(&self, signal: &Signal, ticker: &str) -> Result<Option<ChartData>>;

    /// Renders the final report; returns a path or reference to it
    async fn render_report(&self, run_id: &str, signals: &[Signal]) -> Result<String>;
}

/// Drops items whose `news_id` was already seen, keeping first occurrence
pub fn dedup_items(items: Vec<NewsItem>) -> Vec<NewsItem> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.news_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> NewsItem {
        NewsItem {
            news_id: id.to_string(),
            title: format!("title {id}"),
            summary: String::new(),
            source: "cls".to_string(),
            url: None,
            published_at: None,
            heat: 0.0,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let items = vec![item("a"), item("b"), item("a"), item("c"), item("b")];
        let unique = dedup_items(items);
        let ids: Vec<&str> = unique.iter().map(|i| i.news_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
