// Domain payloads produced by analysis runs
// Signals, charts and transmission graphs carried over the event wire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Signal
// ============================================================================

/// Reference to one affected ticker with direction and rationale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRef {
    pub symbol: String,
    /// "bullish" / "bearish" / "neutral"
    pub direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One hop in a transmission chain explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Source article backing a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A high-value finding distilled from one news item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub run_id: String,
    pub title: String,
    pub summary: String,
    /// 1..=10, how market-moving the event is judged to be
    pub intensity: u8,
    /// -1.0..=1.0
    pub sentiment_score: f64,
    /// 0.0..=1.0
    pub confidence: f64,
    #[serde(default)]
    pub impact_tickers: Vec<TickerRef>,
    #[serde(default)]
    pub transmission_chain: Vec<ChainNode>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(run_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            title: title.into(),
            summary: String::new(),
            intensity: 1,
            sentiment_score: 0.0,
            confidence: 0.0,
            impact_tickers: Vec::new(),
            transmission_chain: Vec::new(),
            sources: Vec::new(),
            news_id: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Charts
// ============================================================================

/// One observed or predicted price sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// ISO date label, e.g. "2026-08-21"
    pub date: String,
    pub price: f64,
}

/// Model-produced forward path for a ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// "bullish" / "bearish" / "neutral"
    pub direction: String,
    pub confidence: f64,
    #[serde(default)]
    pub points: Vec<PricePoint>,
}

/// Price history plus optional prediction for one ticker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartData {
    pub ticker: String,
    pub run_id: String,
    #[serde(default)]
    pub history: Vec<PricePoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
}

// ============================================================================
// Transmission graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    /// "event" / "sector" / "ticker"
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Aggregate event-to-ticker impact graph for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransmissionGraph {
    pub run_id: String,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}
