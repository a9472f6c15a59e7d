// Run configuration

use serde::{Deserialize, Serialize};

use pulse_types::RunRequest;

/// Tunables for one analysis run. Built from the start request; defaults
/// mirror the dashboard's launch form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Optional user query steering discovery and filtering
    #[serde(default)]
    pub query: Option<String>,

    /// Source selector: "financial", "all", or a comma-separated list
    #[serde(default = "default_sources")]
    pub sources: String,

    /// Items fetched per source
    #[serde(default = "default_wide")]
    pub wide: u32,

    /// Concurrency bound for the per-item analysis phase
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cap on sources consulted in the multi-source fetch phase
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,

    /// Cap on query-directed searches per run
    #[serde(default = "default_max_search_queries")]
    pub max_search_queries: usize,
}

fn default_sources() -> String {
    "financial".to_string()
}

fn default_wide() -> u32 {
    10
}

fn default_concurrency() -> usize {
    1
}

fn default_max_sources() -> usize {
    5
}

fn default_max_search_queries() -> usize {
    2
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            query: None,
            sources: default_sources(),
            wide: default_wide(),
            concurrency: default_concurrency(),
            max_sources: default_max_sources(),
            max_search_queries: default_max_search_queries(),
        }
    }
}

impl RunConfig {
    pub fn from_request(request: &RunRequest) -> Self {
        Self {
            query: request.query.clone().filter(|q| !q.trim().is_empty()),
            sources: request.sources.clone(),
            wide: request.wide,
            concurrency: request.concurrency.max(1),
            ..Default::default()
        }
    }

    /// Source names to consult, capped at `max_sources`
    pub fn source_list(&self) -> Vec<String> {
        let names: Vec<String> = match self.sources.as_str() {
            "financial" => vec!["eastmoney".into(), "cls".into(), "wallstreetcn".into()],
            "all" => vec![
                "eastmoney".into(),
                "cls".into(),
                "wallstreetcn".into(),
                "weibo".into(),
                "zhihu".into(),
                "toutiao".into(),
            ],
            list => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };
        names.into_iter().take(self.max_sources).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_blank_query_treated_as_none() {
        let request = RunRequest {
            query: Some("   ".to_string()),
            ..Default::default()
        };
        let config = RunConfig::from_request(&request);
        assert!(config.query.is_none());
    }

    #[test]
    fn source_list_caps_at_max_sources() {
        let config = RunConfig {
            sources: "all".to_string(),
            ..Default::default()
        };
        assert_eq!(config.source_list().len(), 5);
    }

    #[test]
    fn explicit_source_list_parsed() {
        let config = RunConfig {
            sources: "cls, weibo".to_string(),
            ..Default::default()
        };
        assert_eq!(config.source_list(), vec!["cls", "weibo"]);
    }

    #[test]
    fn concurrency_floor_is_one() {
        let request = RunRequest {
            concurrency: 0,
            ..Default::default()
        };
        assert_eq!(RunConfig::from_request(&request).concurrency, 1);
    }
}
