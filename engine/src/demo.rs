// Demo pipeline
// Synthesizes plausible market-news data so the service runs end to end
// without external providers. Latencies and values are jittered to make
// the live stream look like real work.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use pulse_core::{IntentInfo, NewsItem, PulseError, Result, StagePipeline};
use pulse_types::{
    ChainNode, ChartData, PricePoint, Prediction, Signal, SourceRef, TickerRef,
};

const HEADLINES: &[(&str, &str, &str)] = &[
    ("Chip export rules tightened for advanced nodes", "NVDA", "bearish"),
    ("Cloud capex guidance raised across hyperscalers", "MSFT", "bullish"),
    ("Lithium spot prices extend slide on oversupply", "ALB", "bearish"),
    ("Grid storage orders accelerate in Q3", "TSLA", "bullish"),
    ("Rate cut odds jump after soft CPI print", "QQQ", "bullish"),
    ("Shipping rates spike on canal rerouting", "ZIM", "bullish"),
    ("Regulator opens probe into ad pricing", "GOOG", "bearish"),
    ("Obesity drug supply constraints easing", "LLY", "bullish"),
    ("Memory contract prices turn up after cuts", "MU", "bullish"),
    ("Regional bank CRE provisions climb", "KRE", "bearish"),
];

pub struct DemoPipeline {
    reports_dir: PathBuf,
}

impl DemoPipeline {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            reports_dir: state_dir.join("reports"),
        }
    }
}

async fn jitter(max_ms: u64) {
    let ms = rand::thread_rng().gen_range(10..=max_ms.max(11));
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[async_trait]
impl StagePipeline for DemoPipeline {
    async fn interpret_intent(&self, query: &str) -> Result<IntentInfo> {
        jitter(200).await;
        Ok(IntentInfo {
            focus: format!("tracking developments around '{query}'"),
            keywords: query.split_whitespace().map(str::to_string).collect(),
            search_queries: vec![format!("{query} latest"), format!("{query} impact")],
        })
    }

    async fn fetch_source(&self, source: &str, wide: u32) -> Result<Vec<NewsItem>> {
        jitter(400).await;
        let count = (wide as usize).min(HEADLINES.len());
        let items = HEADLINES[..count]
            .iter()
            .enumerate()
            .map(|(n, (title, _, _))| NewsItem {
                news_id: format!("{source}_{n}"),
                title: (*title).to_string(),
                summary: format!("{title}. Reported by {source}."),
                source: source.to_string(),
                url: Some(format!("https://news.example/{source}/{n}")),
                published_at: Some(Utc::now()),
                heat: rand::thread_rng().gen_range(1.0..100.0),
            })
            .collect();
        Ok(items)
    }

    async fn search(&self, query: &str) -> Result<Vec<NewsItem>> {
        jitter(300).await;
        let n = rand::thread_rng().gen_range(0..HEADLINES.len());
        let (title, _, _) = HEADLINES[n];
        Ok(vec![NewsItem {
            news_id: format!("search_{n}"),
            title: title.to_string(),
            summary: format!("{title}. Found via '{query}'."),
            source: "search".to_string(),
            url: None,
            published_at: Some(Utc::now()),
            heat: rand::thread_rng().gen_range(1.0..100.0),
        }])
    }

    async fn refresh_sentiment(&self) -> Result<usize> {
        jitter(200).await;
        Ok(3)
    }

    async fn stored_backlog(&self) -> Result<Vec<NewsItem>> {
        Ok(Vec::new())
    }

    async fn filter_high_value(
        &self,
        items: Vec<NewsItem>,
        intent: Option<&IntentInfo>,
    ) -> Result<Vec<NewsItem>> {
        jitter(200).await;
        // Keyword match trumps heat when a query is steering the run
        let keywords: Vec<String> = intent
            .map(|i| i.keywords.iter().map(|k| k.to_lowercase()).collect())
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|item| {
                let title = item.title.to_lowercase();
                item.heat > 40.0 || keywords.iter().any(|k| title.contains(k))
            })
            .collect())
    }

    async fn analyze_item(
        &self,
        item: &NewsItem,
        _intent: Option<&IntentInfo>,
    ) -> Result<Option<Signal>> {
        jitter(600).await;

        let Some((_, ticker, direction)) = HEADLINES
            .iter()
            .find(|(title, _, _)| *title == item.title)
        else {
            return Ok(None);
        };

        let (intensity, sentiment, confidence) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(4..=9),
                rng.gen_range(-0.9..0.9_f64),
                rng.gen_range(0.5..0.95_f64),
            )
        };

        let mut signal = Signal::new("", item.title.clone());
        signal.summary = item.summary.clone();
        signal.intensity = intensity;
        signal.sentiment_score = sentiment;
        signal.confidence = confidence;
        signal.news_id = Some(item.news_id.clone());
        signal.impact_tickers.push(TickerRef {
            symbol: (*ticker).to_string(),
            direction: (*direction).to_string(),
            reason: Some(format!("primary exposure to: {}", item.title)),
        });
        signal.transmission_chain.push(ChainNode {
            label: "sector repricing".to_string(),
            detail: None,
        });
        signal.sources.push(SourceRef {
            title: item.title.clone(),
            url: item.url.clone(),
            source: Some(item.source.clone()),
        });
        Ok(Some(signal))
    }

    async fn chart_for(&self, signal: &Signal, ticker: &str) -> Result<Option<ChartData>> {
        jitter(200).await;

        let (history, prediction_points, direction) = {
            let mut rng = rand::thread_rng();
            let mut price: f64 = rng.gen_range(40.0..400.0);
            let mut history = Vec::with_capacity(30);
            for day in (0..30).rev() {
                price *= 1.0 + rng.gen_range(-0.02..0.02);
                let date = (Utc::now() - chrono::Duration::days(day)).format("%Y-%m-%d");
                history.push(PricePoint {
                    date: date.to_string(),
                    price: (price * 100.0).round() / 100.0,
                });
            }

            let bullish = signal.sentiment_score >= 0.0;
            let drift = if bullish { 0.01 } else { -0.01 };
            let mut points = Vec::with_capacity(5);
            for day in 1..=5i64 {
                price *= 1.0 + drift + rng.gen_range(-0.005..0.005);
                let date = (Utc::now() + chrono::Duration::days(day)).format("%Y-%m-%d");
                points.push(PricePoint {
                    date: date.to_string(),
                    price: (price * 100.0).round() / 100.0,
                });
            }
            let direction = if bullish { "bullish" } else { "bearish" };
            (history, points, direction)
        };

        Ok(Some(ChartData {
            ticker: ticker.to_string(),
            run_id: String::new(),
            history,
            prediction: Some(Prediction {
                direction: direction.to_string(),
                confidence: signal.confidence,
                points: prediction_points,
            }),
            signal_id: Some(signal.signal_id.clone()),
        }))
    }

    async fn render_report(&self, run_id: &str, signals: &[Signal]) -> Result<String> {
        jitter(300).await;
        fs::create_dir_all(&self.reports_dir)
            .map_err(|e| PulseError::IoError(format!("Failed to create reports dir: {}", e)))?;

        let mut body = format!("# Market Signal Report\n\nRun: {run_id}\n\n");
        let mut ranked: Vec<&Signal> = signals.iter().collect();
        ranked.sort_by(|a, b| b.intensity.cmp(&a.intensity));
        for signal in ranked {
            body.push_str(&format!(
                "## [{}] {}\n\n{}\n\n",
                signal.intensity, signal.title, signal.summary
            ));
            for ticker in &signal.impact_tickers {
                body.push_str(&format!("- {} ({})\n", ticker.symbol, ticker.direction));
            }
            body.push('\n');
        }

        let path = self.reports_dir.join(format!("{run_id}.md"));
        fs::write(&path, body)
            .map_err(|e| PulseError::IoError(format!("Failed to write report: {}", e)))?;
        Ok(path.display().to_string())
    }
}
