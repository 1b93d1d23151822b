//! Ranking aggregation engine: merges the two rating extracts, derives the
//! engagement index, computes category-relative deviations, and produces the
//! final top-N list. Also hosts the run pipeline that wires extraction,
//! persistence, notification, and run reports together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tgrank_core::{
    round1, round2, ChannelDraft, MergedChannel, RankedChannel, ScoredChannel, SourceKind,
};
use tgrank_extract::{parse_rating_page, RatingSource};
use tgrank_notify::{alert_message, NotifierConfig, TelegramNotifier};
use tgrank_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, SnapshotStore};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tgrank-rank";

pub const DEFAULT_TOP_N: usize = 100;
pub const DEFAULT_MEMBERS_URL: &str = "https://tgstat.ru/ratings/channels?sort=members";
pub const DEFAULT_CI_URL: &str = "https://tgstat.ru/ratings/channels?sort=ci";

/// Combines the two rating extracts into one record per distinct channel
/// url. The subscriber-ranking side seeds the map; matched citation-side
/// records merge field by field, unmatched ones append.
///
/// Field rules on a match: rating becomes the mean of the two source ranks
/// (1 decimal place), citation index and subscriber count take the max, and
/// every other field keeps the first-seen value.
pub fn merge(members: Vec<ChannelDraft>, cited: Vec<ChannelDraft>) -> Vec<MergedChannel> {
    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, MergedChannel> = HashMap::new();

    for draft in members {
        if !by_url.contains_key(&draft.url) {
            order.push(draft.url.clone());
            by_url.insert(draft.url.clone(), seed_entry(draft));
        }
    }

    for draft in cited {
        match by_url.get_mut(&draft.url) {
            Some(existing) => {
                existing.rating = round1((existing.rating + draft.rank as f64) / 2.0);
                existing.ci = existing.ci.max(draft.ci);
                existing.subscribers = existing.subscribers.max(draft.subscribers);
            }
            None => {
                order.push(draft.url.clone());
                by_url.insert(draft.url.clone(), seed_entry(draft));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|url| by_url.remove(&url))
        .collect()
}

fn seed_entry(draft: ChannelDraft) -> MergedChannel {
    MergedChannel {
        rating: draft.rank as f64,
        url: draft.url,
        name: draft.name,
        subscribers: draft.subscribers,
        category: draft.category,
        image: draft.image,
        ci: draft.ci,
    }
}

/// Derives the engagement index for every merged channel:
/// `er = round2((rating + ci) / max(subscribers, 1) * 100)`.
///
/// The metric rewards efficiency of engagement over raw reach: a small
/// audience with high rank standing and citation weight scores
/// disproportionately high. The guarded denominator keeps it finite.
pub fn score(merged: Vec<MergedChannel>) -> Vec<ScoredChannel> {
    merged
        .into_iter()
        .map(|m| {
            let base = m.subscribers.max(1) as f64;
            let er = round2((m.rating + m.ci as f64) / base * 100.0);
            ScoredChannel {
                url: m.url,
                name: m.name,
                subscribers: m.subscribers,
                category: m.category,
                image: m.image,
                rating: m.rating,
                ci: m.ci,
                er,
                category_delta_percent: 0,
            }
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
struct CategoryStats {
    sum: f64,
    count: u64,
}

/// Decorates every channel with its rounded percentage deviation from the
/// mean engagement index of its category. Runs over the full scored set,
/// before truncation. A category whose total engagement is zero yields a
/// zero delta for all its members.
pub fn apply_category_deviation(scored: Vec<ScoredChannel>) -> Vec<ScoredChannel> {
    let mut stats: HashMap<String, CategoryStats> = HashMap::new();
    for channel in &scored {
        let entry = stats.entry(channel.category.clone()).or_default();
        entry.sum += channel.er;
        entry.count += 1;
    }

    scored
        .into_iter()
        .map(|mut channel| {
            let s = stats[&channel.category];
            let mean = s.sum / s.count as f64;
            channel.category_delta_percent = deviation_percent(channel.er, mean);
            channel
        })
        .collect()
}

fn deviation_percent(er: f64, mean: f64) -> i64 {
    if mean > 0.0 {
        ((er - mean) / mean * 100.0).round() as i64
    } else {
        0
    }
}

/// Produces the final ordered top-N sequence in two passes.
///
/// Selection into the pool is reach-driven: descending subscriber count,
/// ties broken by citation index, then truncation to `top_n`. Presentation
/// within the pool is engagement-driven: a re-sort descending by `er`.
/// The two orderings are deliberately different and must stay that way.
///
/// Between the passes each pooled channel gets its deviation from the
/// pool's own mean engagement index (divisor falls back to 1 on an empty
/// pool).
pub fn rank(mut scored: Vec<ScoredChannel>, top_n: usize) -> Vec<RankedChannel> {
    scored.sort_by(|a, b| {
        b.subscribers
            .cmp(&a.subscribers)
            .then(b.ci.cmp(&a.ci))
    });
    scored.truncate(top_n);

    let mean = if scored.is_empty() {
        1.0
    } else {
        scored.iter().map(|c| c.er).sum::<f64>() / scored.len() as f64
    };

    let mut ranked: Vec<RankedChannel> = scored
        .into_iter()
        .map(|channel| {
            let mean_delta = deviation_percent(channel.er, mean);
            RankedChannel::from_scored(channel, mean_delta)
        })
        .collect();

    ranked.sort_by(|a, b| b.er.partial_cmp(&a.er).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

#[derive(Debug, Clone)]
pub struct RankConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub top_n: usize,
    pub members_url: String,
    pub ci_url: String,
    pub bot_token: String,
    pub chat_id: String,
    pub notify_log: PathBuf,
    pub workspace_root: PathBuf,
}

impl RankConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:channels.db?mode=rwc".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("TGRANK_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0".to_string()),
            http_timeout_secs: std::env::var("TGRANK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            top_n: std::env::var("TGRANK_TOP_N")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOP_N),
            members_url: std::env::var("TGRANK_MEMBERS_URL")
                .unwrap_or_else(|_| DEFAULT_MEMBERS_URL.to_string()),
            ci_url: std::env::var("TGRANK_CI_URL")
                .unwrap_or_else(|_| DEFAULT_CI_URL.to_string()),
            bot_token: std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            chat_id: std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default(),
            notify_log: std::env::var("TGRANK_NOTIFY_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("notify_failures.log")),
            workspace_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub members_drafts: usize,
    pub citation_drafts: usize,
    pub merged_channels: usize,
    pub ranked_channels: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub persisted: bool,
    pub reports_dir: String,
}

pub struct RankPipeline {
    config: RankConfig,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
    notifier: TelegramNotifier,
}

impl RankPipeline {
    pub fn new(config: RankConfig) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let notifier = TelegramNotifier::new(NotifierConfig {
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            failure_log: config.notify_log.clone(),
        })?;
        Ok(Self {
            config,
            artifact_store,
            http,
            notifier,
        })
    }

    /// One full fetch cycle: fetch both rating pages, archive the raw
    /// markup, run the core stages, persist the snapshot, notify on
    /// above-category-average channels, and write the run report.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let members_source = RatingSource::new(SourceKind::Members, &self.config.members_url);
        let citation_source = RatingSource::new(SourceKind::Citation, &self.config.ci_url);

        // The two extractions are independent and read-only; fetch them
        // concurrently.
        let (members_page, citation_page) = tokio::join!(
            members_source.fetch(&self.http, run_id),
            citation_source.fetch(&self.http, run_id),
        );

        let members_html = self
            .page_or_empty(members_page, SourceKind::Members, started_at)
            .await;
        let citation_html = self
            .page_or_empty(citation_page, SourceKind::Citation, started_at)
            .await;

        let members_drafts = parse_rating_page(&members_html);
        let citation_drafts = parse_rating_page(&citation_html);
        let members_count = members_drafts.len();
        let citation_count = citation_drafts.len();

        let merged = merge(members_drafts, citation_drafts);
        let merged_count = merged.len();
        let scored = apply_category_deviation(score(merged));
        let ranked = rank(scored, self.config.top_n);
        info!(
            run_id = %run_id,
            members = members_count,
            citation = citation_count,
            merged = merged_count,
            ranked = ranked.len(),
            "computed ranked snapshot"
        );

        // Persistence failure never discards the computed sequence; the run
        // report and presentation still see it.
        let persisted = match self.persist(&ranked).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "snapshot persistence failed");
                false
            }
        };

        let (notifications_sent, notifications_failed) = self.notify_above_average(&ranked).await?;

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, persisted, &ranked)
            .await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            members_drafts: members_count,
            citation_drafts: citation_count,
            merged_channels: merged_count,
            ranked_channels: ranked.len(),
            notifications_sent,
            notifications_failed,
            persisted,
            reports_dir: reports_dir.display().to_string(),
        })
    }

    /// Absent markup is tolerated like any other extraction defect: the
    /// source contributes zero drafts and the run continues.
    async fn page_or_empty(
        &self,
        page: Result<tgrank_storage::FetchedPage, tgrank_storage::FetchError>,
        kind: SourceKind,
        fetched_at: DateTime<Utc>,
    ) -> String {
        match page {
            Ok(page) => {
                if let Err(err) = self
                    .artifact_store
                    .store_page(fetched_at, kind.id(), &page.body)
                    .await
                {
                    warn!(source = kind.id(), error = %err, "storing raw page artifact failed");
                }
                page.body
            }
            Err(err) => {
                warn!(source = kind.id(), error = %err, "fetching rating page failed");
                String::new()
            }
        }
    }

    async fn persist(&self, ranked: &[RankedChannel]) -> Result<()> {
        let store = SnapshotStore::connect(&self.config.database_url).await?;
        store.replace_all(ranked).await
    }

    async fn notify_above_average(&self, ranked: &[RankedChannel]) -> Result<(usize, usize)> {
        if !self.notifier.is_configured() {
            return Ok((0, 0));
        }

        let mut sent = 0usize;
        let mut failed = 0usize;
        for channel in ranked.iter().filter(|c| c.category_delta_percent > 0) {
            let message = alert_message(channel);
            let outcome = self.notifier.send(&message).await;
            if outcome.is_delivered() {
                sent += 1;
            } else {
                failed += 1;
                self.notifier.log_failure(&message, &outcome).await?;
            }
        }
        Ok((sent, failed))
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        persisted: bool,
        ranked: &[RankedChannel],
    ) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: "completed".to_string(),
            persisted,
        };

        let ranking_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": run,
            "channels": ranked,
        }))
        .context("serializing ranking report")?;
        fs::write(reports_dir.join("ranking.json"), ranking_json)
            .await
            .context("writing ranking.json")?;

        let above_average = ranked
            .iter()
            .filter(|c| c.category_delta_percent > 0)
            .count();
        let brief = format!(
            "# Channel Rating Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Ranked channels: {}\n- Above category average: {}\n- Persisted: {}\n",
            run.run_id,
            run.started_at,
            run.finished_at,
            ranked.len(),
            above_average,
            persisted,
        );
        fs::write(reports_dir.join("brief.md"), brief)
            .await
            .context("writing brief.md")?;

        Ok(reports_dir)
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = RankConfig::from_env();
    let pipeline = RankPipeline::new(config)?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(url: &str, rank: u64, subscribers: u64, ci: u64) -> ChannelDraft {
        ChannelDraft {
            url: url.to_string(),
            name: format!("name-{url}"),
            subscribers,
            category: "News".to_string(),
            image: String::new(),
            rank,
            ci,
        }
    }

    fn draft_in(url: &str, category: &str, rank: u64, subscribers: u64, ci: u64) -> ChannelDraft {
        let mut d = draft(url, rank, subscribers, ci);
        d.category = category.to_string();
        d
    }

    #[test]
    fn shared_identity_merges_rating_ci_and_subscribers() {
        let members = vec![draft("https://t/x", 5, 1000, 0)];
        let cited = vec![draft("https://t/x", 3, 0, 50)];

        let merged = merge(members, cited);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].rating, 4.0);
        assert_eq!(merged[0].ci, 50);
        assert_eq!(merged[0].subscribers, 1000);

        let scored = score(merged);
        assert_eq!(scored[0].er, 5.4);
    }

    #[test]
    fn max_fields_are_commutative_across_input_order() {
        let a = vec![draft("https://t/x", 5, 1000, 7)];
        let b = vec![draft("https://t/x", 3, 800, 50)];

        let ab = merge(a.clone(), b.clone());
        let ba = merge(b, a);
        assert_eq!(ab[0].ci, ba[0].ci);
        assert_eq!(ab[0].subscribers, ba[0].subscribers);
    }

    #[test]
    fn first_seen_side_wins_for_descriptive_fields() {
        let mut members_side = draft("https://t/x", 5, 1000, 0);
        members_side.name = "Members Name".to_string();
        members_side.category = "Tech".to_string();
        let mut citation_side = draft("https://t/x", 3, 0, 50);
        citation_side.name = "Citation Name".to_string();
        citation_side.category = "Other".to_string();

        let merged = merge(vec![members_side], vec![citation_side]);
        assert_eq!(merged[0].name, "Members Name");
        assert_eq!(merged[0].category, "Tech");
    }

    #[test]
    fn single_source_channels_carry_their_own_rank_without_penalty() {
        let merged = merge(
            vec![draft("https://t/members-only", 2, 500, 0)],
            vec![draft("https://t/ci-only", 9, 300, 40)],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].rating, 2.0);
        assert_eq!(merged[0].ci, 0);
        assert_eq!(merged[1].rating, 9.0);
        assert_eq!(merged[1].ci, 40);
    }

    #[test]
    fn engagement_index_is_finite_for_zero_subscribers() {
        let scored = score(merge(vec![draft("https://t/x", 2, 0, 10)], vec![]));
        assert!(scored[0].er.is_finite());
        assert!(scored[0].er >= 0.0);
        // (2 + 10) / max(0, 1) * 100
        assert_eq!(scored[0].er, 1200.0);
    }

    #[test]
    fn category_deviation_matches_reference_scenario() {
        let scored = vec![
            scored_with_er("https://t/a", "News", 10.0),
            scored_with_er("https://t/b", "News", 20.0),
        ];
        let decorated = apply_category_deviation(scored);
        assert_eq!(decorated[0].category_delta_percent, -33);
        assert_eq!(decorated[1].category_delta_percent, 33);
    }

    #[test]
    fn zero_engagement_category_yields_zero_deltas() {
        let scored = vec![
            scored_with_er("https://t/a", "Dead", 0.0),
            scored_with_er("https://t/b", "Dead", 0.0),
        ];
        for channel in apply_category_deviation(scored) {
            assert_eq!(channel.category_delta_percent, 0);
        }
    }

    #[test]
    fn deviations_are_consistent_with_recomputed_means() {
        let scored = apply_category_deviation(score(merge(
            vec![
                draft_in("https://t/a", "News", 1, 100, 5),
                draft_in("https://t/b", "News", 2, 200, 9),
                draft_in("https://t/c", "Tech", 3, 50, 2),
            ],
            vec![],
        )));

        let news: Vec<_> = scored.iter().filter(|c| c.category == "News").collect();
        let mean = news.iter().map(|c| c.er).sum::<f64>() / news.len() as f64;
        for channel in news {
            let expected = ((channel.er - mean) / mean * 100.0).round() as i64;
            assert_eq!(channel.category_delta_percent, expected);
        }
    }

    #[test]
    fn truncation_caps_at_n_and_returns_all_when_fewer() {
        let scored: Vec<ScoredChannel> = (0..5u64)
            .map(|i| {
                let mut c = scored_with_er(&format!("https://t/{i}"), "News", i as f64);
                c.subscribers = 100 + i;
                c
            })
            .collect();

        assert_eq!(rank(scored.clone(), 3).len(), 3);
        assert_eq!(rank(scored, 10).len(), 5);
    }

    #[test]
    fn selection_is_reach_driven_not_engagement_driven() {
        // Tiny channel with a huge engagement index must still lose the
        // top-2 cut to the two big-reach channels.
        let mut tiny = scored_with_er("https://t/tiny", "News", 900.0);
        tiny.subscribers = 10;
        let mut big_a = scored_with_er("https://t/big-a", "News", 1.0);
        big_a.subscribers = 1_000_000;
        let mut big_b = scored_with_er("https://t/big-b", "News", 2.0);
        big_b.subscribers = 900_000;

        let ranked = rank(vec![tiny, big_a, big_b], 2);
        let urls: Vec<_> = ranked.iter().map(|c| c.url.as_str()).collect();
        assert!(!urls.contains(&"https://t/tiny"));
        // Within the pool the display order is engagement-driven.
        assert_eq!(urls, vec!["https://t/big-b", "https://t/big-a"]);
    }

    #[test]
    fn reach_ties_break_on_citation_index() {
        let mut low_ci = scored_with_er("https://t/low", "News", 1.0);
        low_ci.subscribers = 1000;
        low_ci.ci = 5;
        let mut high_ci = scored_with_er("https://t/high", "News", 1.0);
        high_ci.subscribers = 1000;
        high_ci.ci = 50;

        let ranked = rank(vec![low_ci, high_ci], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].url, "https://t/high");
    }

    #[test]
    fn final_order_is_non_increasing_in_engagement() {
        let scored = apply_category_deviation(score(merge(
            vec![
                draft("https://t/a", 1, 1000, 5),
                draft("https://t/b", 2, 500, 80),
                draft("https://t/c", 3, 2000, 1),
                draft("https://t/d", 4, 750, 30),
            ],
            vec![],
        )));
        let ranked = rank(scored, 100);
        for pair in ranked.windows(2) {
            assert!(pair[0].er >= pair[1].er);
        }
    }

    #[test]
    fn pool_mean_deviation_is_computed_on_the_truncated_pool() {
        let mut a = scored_with_er("https://t/a", "News", 10.0);
        a.subscribers = 1000;
        let mut b = scored_with_er("https://t/b", "News", 20.0);
        b.subscribers = 900;
        // Excluded from the pool by reach; must not influence the mean.
        let mut c = scored_with_er("https://t/c", "News", 90.0);
        c.subscribers = 10;

        let ranked = rank(vec![a, b, c], 2);
        // Pool mean is 15.0: 20 -> +33, 10 -> -33.
        let by_url: HashMap<_, _> = ranked
            .iter()
            .map(|r| (r.url.as_str(), r.mean_delta_percent))
            .collect();
        assert_eq!(by_url["https://t/b"], 33);
        assert_eq!(by_url["https://t/a"], -33);
    }

    #[test]
    fn empty_inputs_produce_an_empty_ranked_set() {
        let ranked = rank(
            apply_category_deviation(score(merge(vec![], vec![]))),
            DEFAULT_TOP_N,
        );
        assert!(ranked.is_empty());
    }

    fn scored_with_er(url: &str, category: &str, er: f64) -> ScoredChannel {
        ScoredChannel {
            url: url.to_string(),
            name: format!("name-{url}"),
            subscribers: 0,
            category: category.to_string(),
            image: String::new(),
            rating: 0.0,
            ci: 0,
            er,
            category_delta_percent: 0,
        }
    }
}
