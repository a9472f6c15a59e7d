// Orchestrator
// Drives one run through its fixed phase sequence, emitting progress and
// steps along the way. Cancellation is cooperative: phases check the run
// context between units of work, and the resulting `Cancelled` error is
// caught exactly once here and mapped to the cancelled terminal state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use pulse_types::{
    ChainNode, ChartData, EventPayload, GraphEdge, GraphNode, RunPatch, RunStatus, Signal, Step,
    StepType, TransmissionGraph,
};

use crate::bridge::RunContext;
use crate::config::RunConfig;
use crate::error::{PulseError, Result};
use crate::executor::execute_bounded;
use crate::stages::{dedup_items, IntentInfo, NewsItem, StagePipeline};
use crate::store::RunStore;

/// Failure messages persisted to the run record are capped at this many
/// characters; full detail goes to the log.
const MAX_ERROR_LEN: usize = 500;

struct RunOutput {
    signal_count: u32,
    report_path: Option<String>,
}

/// One item's analysis result, produced on a worker and folded in on the
/// orchestrator's context in completion order.
struct ItemOutcome {
    signal: Option<Signal>,
    charts: Vec<ChartData>,
}

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    pipeline: Arc<dyn StagePipeline>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, pipeline: Arc<dyn StagePipeline>) -> Self {
        Self { store, pipeline }
    }

    /// Executes the run to a terminal state. The run record must already
    /// exist in the store; this is the only place that writes its terminal
    /// status. Never returns an error: every outcome is absorbed into the
    /// record and the event stream.
    pub async fn run(&self, ctx: RunContext, config: RunConfig) {
        match self.drive(&ctx, &config).await {
            Ok(output) => self.handle_completion(&ctx, output),
            Err(PulseError::Cancelled) => self.handle_cancellation(&ctx),
            Err(err) => self.handle_failure(&ctx, err),
        }
    }

    async fn drive(&self, ctx: &RunContext, config: &RunConfig) -> Result<RunOutput> {
        // ----- init (5%) -----
        self.store.update_run(
            &ctx.run_id,
            &RunPatch {
                status: Some(RunStatus::Running),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        ctx.phase("init", 5, "Run started");
        ctx.step(
            StepType::Config,
            "System",
            format!(
                "sources={} wide={} concurrency={} query={}",
                config.sources,
                config.wide,
                config.concurrency,
                config.query.as_deref().unwrap_or("-")
            ),
        );
        ctx.checkpoint()?;

        // Intent interpretation, query-directed runs only
        let intent = match &config.query {
            Some(query) => match self.pipeline.interpret_intent(query).await {
                Ok(intent) => {
                    ctx.step(
                        StepType::Thought,
                        "IntentAgent",
                        format!("focus: {}", intent.focus),
                    );
                    Some(intent)
                }
                Err(err) => {
                    // A broad run is still useful without intent
                    warn!(run_id = %ctx.run_id, "intent interpretation failed: {err}");
                    ctx.step(
                        StepType::Warning,
                        "IntentAgent",
                        format!("intent interpretation failed: {err}"),
                    );
                    None
                }
            },
            None => None,
        };
        ctx.checkpoint()?;

        // ----- discovery (10% / 15% / 22%) -----
        let items = self.discover(ctx, config, intent.as_ref()).await?;

        // ----- sentiment (28%) -----
        ctx.phase("sentiment", 28, "Refreshing market sentiment");
        match self.pipeline.refresh_sentiment().await {
            Ok(touched) => ctx.step(
                StepType::ToolCall,
                "TrendAgent",
                format!("refreshed sentiment for {touched} series"),
            ),
            Err(err) => {
                warn!(run_id = %ctx.run_id, "sentiment refresh failed: {err}");
                ctx.step(
                    StepType::Warning,
                    "TrendAgent",
                    format!("sentiment refresh failed: {err}"),
                );
            }
        }
        ctx.checkpoint()?;

        if items.is_empty() {
            ctx.step(StepType::Result, "System", "No items discovered, nothing to analyze");
            return Ok(RunOutput {
                signal_count: 0,
                report_path: None,
            });
        }

        // ----- filter (35%) -----
        ctx.phase("filter", 35, format!("Filtering {} items", items.len()));
        let filtered = self
            .pipeline
            .filter_high_value(items, intent.as_ref())
            .await?;
        ctx.step(
            StepType::Result,
            "FinAgent",
            format!("{} items kept for deep analysis", filtered.len()),
        );
        ctx.checkpoint()?;

        if filtered.is_empty() {
            ctx.step(StepType::Result, "System", "No high-value items this run");
            return Ok(RunOutput {
                signal_count: 0,
                report_path: None,
            });
        }

        // ----- analysis (50% + completion share of 25%) -----
        let signals = self.analyze(ctx, config, intent.as_ref(), filtered).await?;
        ctx.checkpoint()?;

        if signals.is_empty() {
            ctx.step(StepType::Result, "System", "Analysis produced no signals");
            return Ok(RunOutput {
                signal_count: 0,
                report_path: None,
            });
        }

        // Final graph also covers signals that carried no chain hops
        ctx.graph(build_graph(&ctx.run_id, &signals));

        // ----- report (85%) -----
        ctx.phase("report", 85, "Rendering report");
        let report_path = match self.pipeline.render_report(&ctx.run_id, &signals).await {
            Ok(path) => {
                ctx.step(StepType::Result, "ReportAgent", format!("report at {path}"));
                Some(path)
            }
            Err(err) => {
                // Signals are already persisted; a lost report is a warning
                warn!(run_id = %ctx.run_id, "report rendering failed: {err}");
                ctx.step(
                    StepType::Warning,
                    "ReportAgent",
                    format!("report rendering failed: {err}"),
                );
                None
            }
        };

        Ok(RunOutput {
            signal_count: signals.len() as u32,
            report_path,
        })
    }

    /// Trend fetch, multi-source fetch, and active search. Individual
    /// source or search failures are absorbed as warnings.
    async fn discover(
        &self,
        ctx: &RunContext,
        config: &RunConfig,
        intent: Option<&IntentInfo>,
    ) -> Result<Vec<NewsItem>> {
        let sources = config.source_list();
        let mut items: Vec<NewsItem> = Vec::new();

        if let Some((first, rest)) = sources.split_first() {
            ctx.phase("trend", 10, format!("Fetching hot items from {first}"));
            self.fetch_into(ctx, first, config.wide, &mut items).await;
            ctx.checkpoint()?;

            if !rest.is_empty() {
                ctx.phase(
                    "multi_source",
                    15,
                    format!("Fetching {} additional sources", rest.len()),
                );
                for source in rest {
                    self.fetch_into(ctx, source, config.wide, &mut items).await;
                    ctx.checkpoint()?;
                }
            }
        }

        let queries: Vec<&String> = intent
            .map(|i| i.search_queries.iter().take(config.max_search_queries).collect())
            .unwrap_or_default();
        if !queries.is_empty() {
            ctx.phase("search", 22, format!("Running {} searches", queries.len()));
            for query in queries {
                match self.pipeline.search(query).await {
                    Ok(found) => {
                        ctx.step(
                            StepType::ToolCall,
                            "TrendAgent",
                            format!("search '{query}' returned {} items", found.len()),
                        );
                        items.extend(found);
                    }
                    Err(err) => {
                        warn!(run_id = %ctx.run_id, "search '{query}' failed: {err}");
                        ctx.step(
                            StepType::Warning,
                            "TrendAgent",
                            format!("search '{query}' failed: {err}"),
                        );
                    }
                }
                ctx.checkpoint()?;
            }
        }

        match self.pipeline.stored_backlog().await {
            Ok(backlog) if !backlog.is_empty() => {
                ctx.step(
                    StepType::ToolCall,
                    "TrendAgent",
                    format!("merged {} stored items", backlog.len()),
                );
                items.extend(backlog);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(run_id = %ctx.run_id, "stored backlog unavailable: {err}");
            }
        }

        Ok(dedup_items(items))
    }

    async fn fetch_into(&self, ctx: &RunContext, source: &str, wide: u32, items: &mut Vec<NewsItem>) {
        match self.pipeline.fetch_source(source, wide).await {
            Ok(found) => {
                ctx.step(
                    StepType::ToolCall,
                    "TrendAgent",
                    format!("{source}: {} items", found.len()),
                );
                items.extend(found);
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, source, "source fetch failed: {err}");
                ctx.step(
                    StepType::Warning,
                    "TrendAgent",
                    format!("{source} fetch failed: {err}"),
                );
            }
        }
    }

    /// Per-item deep analysis under the configured concurrency bound.
    /// Results are folded in completion order; a failed item costs one
    /// warning step, never the run.
    async fn analyze(
        &self,
        ctx: &RunContext,
        config: &RunConfig,
        intent: Option<&IntentInfo>,
        items: Vec<NewsItem>,
    ) -> Result<Vec<Signal>> {
        let total = items.len();
        ctx.phase("analysis", 50, format!("Deep analysis of {total} items"));

        let mut signals: Vec<Signal> = Vec::new();
        let mut completed = 0usize;

        execute_bounded(
            items,
            config.concurrency,
            &ctx.cancel,
            |item| {
                let pipeline = self.pipeline.clone();
                let intent = intent.cloned();
                async move {
                    let signal = pipeline.analyze_item(&item, intent.as_ref()).await?;
                    let mut charts = Vec::new();
                    if let Some(signal) = &signal {
                        for ticker in &signal.impact_tickers {
                            match pipeline.chart_for(signal, &ticker.symbol).await {
                                Ok(Some(chart)) => charts.push(chart),
                                Ok(None) => {}
                                Err(err) => {
                                    warn!(ticker = %ticker.symbol, "chart fetch failed: {err}")
                                }
                            }
                        }
                    }
                    Ok(ItemOutcome { signal, charts })
                }
            },
            |_, outcome: Result<ItemOutcome>| {
                completed += 1;
                let progress = 50 + (completed * 25 / total) as u8;
                ctx.emit(EventPayload::Progress {
                    run_id: String::new(),
                    phase: "analysis".to_string(),
                    progress,
                });

                match outcome {
                    Ok(ItemOutcome { signal: Some(signal), charts }) => {
                        // Signal step is persisted here so a crash after this
                        // point cannot lose an already-found signal
                        let mut step = Step::new(
                            StepType::Signal,
                            "FinAgent",
                            format!("[{}] {}", signal.intensity, signal.title),
                        );
                        step.run_id = ctx.run_id.clone();
                        if let Err(err) = self.store.append_step(&step) {
                            warn!(run_id = %ctx.run_id, "failed to persist signal step: {err}");
                        }

                        ctx.signal(signal.clone());
                        for chart in charts {
                            ctx.chart(chart);
                        }
                        let has_chain = !signal.transmission_chain.is_empty();
                        signals.push(signal);
                        // Observers watch the graph grow while analysis runs
                        if has_chain {
                            ctx.graph(build_graph(&ctx.run_id, &signals));
                        }
                    }
                    Ok(ItemOutcome { signal: None, .. }) => {}
                    Err(err) => {
                        ctx.step(
                            StepType::Warning,
                            "FinAgent",
                            format!("item analysis failed: {err}"),
                        );
                    }
                }
            },
        )
        .await?;

        Ok(signals)
    }

    // ===== Terminal handlers =====

    fn handle_completion(&self, ctx: &RunContext, output: RunOutput) {
        info!(run_id = %ctx.run_id, signals = output.signal_count, "run completed");
        let patch = RunPatch {
            status: Some(RunStatus::Completed),
            finished_at: Some(Utc::now()),
            signal_count: Some(output.signal_count),
            report_path: output.report_path,
            ..Default::default()
        };
        if let Err(err) = self.store.update_run(&ctx.run_id, &patch) {
            warn!(run_id = %ctx.run_id, "failed to persist completion: {err}");
        }
        ctx.phase("done", 100, "Run completed");
        ctx.emit(EventPayload::Completed {
            run_id: String::new(),
            signal_count: output.signal_count,
        });
    }

    fn handle_cancellation(&self, ctx: &RunContext) {
        info!(run_id = %ctx.run_id, "run cancelled");
        let patch = RunPatch {
            status: Some(RunStatus::Cancelled),
            finished_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(err) = self.store.update_run(&ctx.run_id, &patch) {
            warn!(run_id = %ctx.run_id, "failed to persist cancellation: {err}");
        }
        ctx.step(StepType::Status, "System", "Run cancelled");
    }

    fn handle_failure(&self, ctx: &RunContext, err: PulseError) {
        let message = truncate_message(&err.to_string());
        warn!(run_id = %ctx.run_id, "run failed: {err}");
        let patch = RunPatch {
            status: Some(RunStatus::Failed),
            finished_at: Some(Utc::now()),
            error_message: Some(message.clone()),
            ..Default::default()
        };
        if let Err(store_err) = self.store.update_run(&ctx.run_id, &patch) {
            warn!(run_id = %ctx.run_id, "failed to persist failure: {store_err}");
        }
        ctx.step(StepType::Error, "System", message.clone());
        ctx.emit(EventPayload::Error {
            run_id: String::new(),
            message,
        });
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_ERROR_LEN).collect();
    truncated.push_str("...");
    truncated
}

/// Event -> chain -> ticker impact graph across all of a run's signals
fn build_graph(run_id: &str, signals: &[Signal]) -> TransmissionGraph {
    let mut graph = TransmissionGraph {
        run_id: run_id.to_string(),
        ..Default::default()
    };
    let mut seen_tickers = std::collections::HashSet::new();

    for signal in signals {
        graph.nodes.push(GraphNode {
            id: signal.signal_id.clone(),
            label: signal.title.clone(),
            kind: "event".to_string(),
        });

        // Chain hops become intermediate nodes between event and tickers
        let mut tail = signal.signal_id.clone();
        for (hop, ChainNode { label, .. }) in signal.transmission_chain.iter().enumerate() {
            let node_id = format!("{}_chain_{}", signal.signal_id, hop);
            graph.nodes.push(GraphNode {
                id: node_id.clone(),
                label: label.clone(),
                kind: "sector".to_string(),
            });
            graph.edges.push(GraphEdge {
                from: tail,
                to: node_id.clone(),
                label: None,
            });
            tail = node_id;
        }

        for ticker in &signal.impact_tickers {
            if seen_tickers.insert(ticker.symbol.clone()) {
                graph.nodes.push(GraphNode {
                    id: ticker.symbol.clone(),
                    label: ticker.symbol.clone(),
                    kind: "ticker".to_string(),
                });
            }
            graph.edges.push(GraphEdge {
                from: tail.clone(),
                to: ticker.symbol.clone(),
                label: Some(ticker.direction.clone()),
            });
        }
    }
    graph
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{DeliveryCommand, EventBridge};
    use crate::store::JsonRunStore;
    use async_trait::async_trait;
    use pulse_types::{Run, TickerRef};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Deterministic pipeline: `items` per source, every item whose id is in
    /// `failing` errors during analysis, every other item yields one signal.
    struct MockPipeline {
        items_per_source: usize,
        failing: HashSet<String>,
        signal_free: HashSet<String>,
        fail_filter: bool,
        analyze_calls: AtomicUsize,
    }

    impl Default for MockPipeline {
        fn default() -> Self {
            Self {
                items_per_source: 3,
                failing: HashSet::new(),
                signal_free: HashSet::new(),
                fail_filter: false,
                analyze_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StagePipeline for MockPipeline {
        async fn interpret_intent(&self, query: &str) -> Result<IntentInfo> {
            Ok(IntentInfo {
                focus: query.to_string(),
                keywords: vec![query.to_string()],
                search_queries: vec![format!("{query} latest")],
            })
        }

        async fn fetch_source(&self, source: &str, _wide: u32) -> Result<Vec<NewsItem>> {
            Ok((0..self.items_per_source)
                .map(|n| NewsItem {
                    news_id: format!("{source}_{n}"),
                    title: format!("{source} item {n}"),
                    summary: String::new(),
                    source: source.to_string(),
                    url: None,
                    published_at: None,
                    heat: n as f64,
                })
                .collect())
        }

        async fn search(&self, _query: &str) -> Result<Vec<NewsItem>> {
            Ok(Vec::new())
        }

        async fn refresh_sentiment(&self) -> Result<usize> {
            Ok(2)
        }

        async fn stored_backlog(&self) -> Result<Vec<NewsItem>> {
            Ok(Vec::new())
        }

        async fn filter_high_value(
            &self,
            items: Vec<NewsItem>,
            _intent: Option<&IntentInfo>,
        ) -> Result<Vec<NewsItem>> {
            if self.fail_filter {
                return Err(PulseError::Stage("filter model unavailable".to_string()));
            }
            Ok(items)
        }

        async fn analyze_item(
            &self,
            item: &NewsItem,
            _intent: Option<&IntentInfo>,
        ) -> Result<Option<Signal>> {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&item.news_id) {
                return Err(PulseError::Stage(format!("cannot analyze {}", item.news_id)));
            }
            if self.signal_free.contains(&item.news_id) {
                return Ok(None);
            }
            let mut signal = Signal::new("", item.title.clone());
            signal.news_id = Some(item.news_id.clone());
            signal.intensity = 6;
            signal.transmission_chain.push(ChainNode {
                label: "compute supply chain".to_string(),
                detail: None,
            });
            signal.impact_tickers.push(TickerRef {
                symbol: "NVDA".to_string(),
                direction: "bullish".to_string(),
                reason: None,
            });
            Ok(Some(signal))
        }

        async fn chart_for(&self, _signal: &Signal, ticker: &str) -> Result<Option<ChartData>> {
            Ok(Some(ChartData {
                ticker: ticker.to_string(),
                run_id: String::new(),
                history: Vec::new(),
                prediction: None,
                signal_id: None,
            }))
        }

        async fn render_report(&self, run_id: &str, _signals: &[Signal]) -> Result<String> {
            Ok(format!("reports/{run_id}.md"))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<JsonRunStore>,
        ctx: RunContext,
        rx: mpsc::UnboundedReceiver<DeliveryCommand>,
        cancel: CancellationToken,
        _temp: tempfile::TempDir,
    }

    fn harness(pipeline: MockPipeline) -> Harness {
        let temp = tempdir().unwrap();
        let store = Arc::new(JsonRunStore::new(temp.path()).unwrap());

        let mut run = Run::new("run_1".to_string(), None, "financial".to_string());
        run.status = RunStatus::Idle;
        store.create_run(&run).unwrap();

        let bridge = EventBridge::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bridge.enable(tx);

        let cancel = CancellationToken::new();
        let ctx = RunContext::new("run_1", bridge, cancel.clone());
        let orchestrator = Orchestrator::new(store.clone(), Arc::new(pipeline));

        Harness {
            orchestrator,
            store,
            ctx,
            rx,
            cancel,
            _temp: temp,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeliveryCommand>) -> Vec<EventPayload> {
        let mut events = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let DeliveryCommand::Event(event) = command {
                events.push(event.payload);
            }
        }
        events
    }

    #[tokio::test]
    async fn happy_path_completes_with_signals() {
        let mut h = harness(MockPipeline::default());
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let run = h.store.get_run("run_1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.signal_count, 9); // 3 sources x 3 items
        assert_eq!(run.report_path.as_deref(), Some("reports/run_1.md"));
        assert!(run.finished_at.is_some());

        let events = drain(&mut h.rx);
        let signal_count = events
            .iter()
            .filter(|e| matches!(e, EventPayload::Signal(_)))
            .count();
        assert_eq!(signal_count, 9);
        assert!(events
            .iter()
            .any(|e| matches!(e, EventPayload::Completed { signal_count: 9, .. })));
        assert!(events.iter().any(|e| matches!(e, EventPayload::Graph(_))));
        // Every event carries the emitting run's id
        assert!(events.iter().all(|e| e.run_id() == "run_1"));
    }

    #[tokio::test]
    async fn zero_discovered_items_is_a_completion() {
        let mut h = harness(MockPipeline {
            items_per_source: 0,
            ..Default::default()
        });
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let run = h.store.get_run("run_1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.signal_count, 0);
        assert!(run.report_path.is_none());

        let events = drain(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, EventPayload::Completed { signal_count: 0, .. })));
        assert!(!events.iter().any(|e| matches!(e, EventPayload::Error { .. })));
    }

    #[tokio::test]
    async fn per_item_failures_are_absorbed() {
        let failing: HashSet<String> =
            ["eastmoney_0".to_string(), "cls_1".to_string()].into_iter().collect();
        let mut h = harness(MockPipeline {
            failing,
            ..Default::default()
        });
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let run = h.store.get_run("run_1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.signal_count, 7);

        let events = drain(&mut h.rx);
        let warnings = events
            .iter()
            .filter(|e| {
                matches!(e, EventPayload::Step(step) if step.step_type == StepType::Warning)
            })
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn signal_set_is_independent_of_concurrency() {
        let mut sets = Vec::new();
        for concurrency in [1usize, 4] {
            let mut h = harness(MockPipeline::default());
            let config = RunConfig {
                concurrency,
                ..Default::default()
            };
            h.orchestrator.run(h.ctx.clone(), config).await;

            let ids: HashSet<String> = drain(&mut h.rx)
                .into_iter()
                .filter_map(|e| match e {
                    EventPayload::Signal(s) => s.news_id,
                    _ => None,
                })
                .collect();
            sets.push(ids);
        }
        assert_eq!(sets[0], sets[1]);
        assert_eq!(sets[0].len(), 9);
    }

    #[tokio::test]
    async fn fatal_error_fails_run_with_truncated_message() {
        let mut h = harness(MockPipeline {
            fail_filter: true,
            ..Default::default()
        });
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let run = h.store.get_run("run_1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let message = run.error_message.unwrap();
        assert!(message.contains("filter model unavailable"));
        assert!(message.chars().count() <= MAX_ERROR_LEN + 3);

        let events = drain(&mut h.rx);
        assert!(events.iter().any(|e| matches!(e, EventPayload::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, EventPayload::Completed { .. })));
    }

    #[tokio::test]
    async fn cancellation_before_work_lands_in_cancelled_state() {
        let mut h = harness(MockPipeline::default());
        h.cancel.cancel();
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let run = h.store.get_run("run_1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.finished_at.is_some());

        let events = drain(&mut h.rx);
        assert!(!events.iter().any(|e| matches!(e, EventPayload::Completed { .. })));
        assert!(!events.iter().any(|e| matches!(e, EventPayload::Error { .. })));
    }

    #[tokio::test]
    async fn graph_grows_as_analysis_progresses() {
        let mut h = harness(MockPipeline::default());
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;

        let graphs: Vec<TransmissionGraph> = drain(&mut h.rx)
            .into_iter()
            .filter_map(|e| match e {
                EventPayload::Graph(graph) => Some(graph),
                _ => None,
            })
            .collect();

        // One cumulative frame per analyzed signal plus the final one
        assert_eq!(graphs.len(), 10);
        for pair in graphs.windows(2) {
            assert!(pair[0].nodes.len() <= pair[1].nodes.len());
        }
        let event_nodes = graphs
            .last()
            .unwrap()
            .nodes
            .iter()
            .filter(|node| node.kind == "event")
            .count();
        assert_eq!(event_nodes, 9);
    }

    #[tokio::test]
    async fn signal_steps_are_persisted_during_analysis() {
        let h = harness(MockPipeline {
            items_per_source: 1,
            ..Default::default()
        });
        let mut rx = h.rx;
        h.orchestrator
            .run(h.ctx.clone(), RunConfig::default())
            .await;
        drain(&mut rx);

        let steps = h.store.list_steps("run_1", None).unwrap();
        let signal_steps: Vec<_> = steps
            .iter()
            .filter(|s| s.step_type == StepType::Signal)
            .collect();
        assert_eq!(signal_steps.len(), 3);
        assert!(signal_steps.iter().all(|s| s.run_id == "run_1"));
    }

    #[test]
    fn message_truncation_keeps_prefix() {
        let long = "x".repeat(2000);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LEN + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn graph_links_events_through_chain_to_tickers() {
        let mut signal = Signal::new("run_1", "Rate cut odds jump");
        signal.transmission_chain.push(ChainNode {
            label: "rate-sensitive growth".to_string(),
            detail: None,
        });
        signal.impact_tickers.push(TickerRef {
            symbol: "QQQ".to_string(),
            direction: "bullish".to_string(),
            reason: None,
        });

        let graph = build_graph("run_1", &[signal.clone()]);
        assert_eq!(graph.nodes.len(), 3); // event, chain hop, ticker
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[1].to, "QQQ");
        assert_eq!(graph.edges[1].label.as_deref(), Some("bullish"));
    }
}
