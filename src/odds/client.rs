use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::provider::{OddsSource, ProjectionSource};
use crate::db::models::{BookmakerLine, ModelProjection};
use crate::error::FeedError;
use crate::live_scores::sports::{retry_after, slugify};

/// Player-prop markets requested by default.
pub const DEFAULT_MARKETS: &[&str] = &[
    "player_points",
    "player_rebounds",
    "player_assists",
    "player_threes",
];

/// Client for The Odds API v4 event odds endpoint.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct OddsApiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    sport: String,
    regions: String,
    markets: Vec<String>,
}

impl OddsApiClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid odds API url: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Odds API url cannot be a base: {}", base_url);
        }
        Ok(OddsApiClient {
            http,
            base_url,
            api_key: api_key.to_string(),
            sport: "basketball_nba".into(),
            regions: "us".into(),
            markets: DEFAULT_MARKETS.iter().map(|m| m.to_string()).collect(),
        })
    }

    pub fn with_sport(mut self, sport: &str) -> Self {
        self.sport = sport.to_string();
        self
    }

    pub fn with_markets(mut self, markets: Vec<String>) -> Self {
        if !markets.is_empty() {
            self.markets = markets;
        }
        self
    }

    fn event_odds_url(&self, game_id: &str) -> Result<Url, FeedError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Malformed(format!("odds url {} has no path", self.base_url)))?
            .pop_if_empty()
            .extend(["v4", "sports", self.sport.as_str(), "events", game_id, "odds"]);
        url.query_pairs_mut()
            .append_pair("apiKey", &self.api_key)
            .append_pair("regions", &self.regions)
            .append_pair("markets", &self.markets.join(","))
            .append_pair("oddsFormat", "decimal");
        Ok(url)
    }
}

#[async_trait]
impl OddsSource for OddsApiClient {
    fn name(&self) -> &str {
        "the-odds-api"
    }

    async fn fetch_lines(&self, game_id: &str) -> Result<Vec<BookmakerLine>, FeedError> {
        let url = self.event_odds_url(game_id)?;
        debug!("Fetching odds for game {}", game_id);

        let resp = self.http.get(url).send().await?;

        if let Some(remaining) = resp
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
        {
            debug!("Odds API quota remaining: {}", remaining);
        }

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FeedError::RateLimited {
                    source_name: self.name().to_string(),
                    retry_after: retry_after(resp.headers()),
                })
            }
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(FeedError::UnknownGame(game_id.to_string()))
            }
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(FeedError::Unavailable(format!("Odds API error {}: {}", s, body)));
            }
            _ => {}
        }

        let raw: serde_json::Value = resp.json().await?;
        let lines = parse_event_odds(&raw)?;
        debug!("Game {}: {} bookmaker line(s)", game_id, lines.len());
        Ok(lines)
    }
}

#[derive(Default)]
struct PendingQuote {
    player_name: String,
    over: Option<f64>,
    under: Option<f64>,
}

/// Pair up Over/Under outcomes into one `BookmakerLine` per
/// (bookmaker, market, player, point). Half-quoted lines are dropped.
fn parse_event_odds(raw: &serde_json::Value) -> Result<Vec<BookmakerLine>, FeedError> {
    let bookmakers = match raw.get("bookmakers") {
        Some(serde_json::Value::Array(b)) => b,
        Some(serde_json::Value::Null) | None => return Ok(vec![]),
        Some(_) => return Err(FeedError::Malformed("bookmakers is not a list".into())),
    };

    // BTreeMap keeps output order deterministic.
    let mut pending: BTreeMap<(String, String, String, String), PendingQuote> = BTreeMap::new();

    for book in bookmakers {
        let Some(bookmaker) = book["key"].as_str().or_else(|| book["title"].as_str()) else {
            continue;
        };
        let Some(markets) = book["markets"].as_array() else {
            continue;
        };
        for market in markets {
            let Some(market_key) = market["key"].as_str() else {
                continue;
            };
            for outcome in market["outcomes"].as_array().into_iter().flatten() {
                let (Some(side), Some(player), Some(point), Some(price)) = (
                    outcome["name"].as_str(),
                    outcome["description"].as_str(),
                    number(&outcome["point"]),
                    number(&outcome["price"]),
                ) else {
                    continue;
                };
                let key = (
                    bookmaker.to_string(),
                    market_key.to_string(),
                    slugify(player),
                    format!("{}", point),
                );
                let quote = pending.entry(key).or_insert_with(|| PendingQuote {
                    player_name: player.to_string(),
                    ..Default::default()
                });
                match side.to_lowercase().as_str() {
                    "over" => quote.over = Some(price),
                    "under" => quote.under = Some(price),
                    other => warn!("Unexpected outcome '{}' in {} from {}", other, market_key, bookmaker),
                }
            }
        }
    }

    Ok(pending
        .into_iter()
        .filter_map(|((bookmaker, market, player_id, point), q)| {
            Some(BookmakerLine {
                bookmaker,
                player_id,
                player_name: q.player_name,
                market,
                line: point.parse().ok()?,
                over: q.over?,
                under: q.under?,
            })
        })
        .collect())
}

fn number(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|n: &f64| n.is_finite())
}

// ── Projections ──────────────────────────────────────────────────────────────

/// HTTP client for the projection model service:
/// `GET {base}/games/{game_id}/projections` returning a list of projections.
pub struct ProjectionClient {
    http: Client,
    base_url: Url,
}

impl ProjectionClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid projections url: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Projections url cannot be a base: {}", base_url);
        }
        Ok(ProjectionClient { http, base_url })
    }
}

#[async_trait]
impl ProjectionSource for ProjectionClient {
    fn name(&self) -> &str {
        "projections"
    }

    async fn fetch_projections(&self, game_id: &str) -> Result<Vec<ModelProjection>, FeedError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Malformed(format!("projections url {} has no path", self.base_url)))?
            .pop_if_empty()
            .extend(["games", game_id, "projections"]);

        let resp = self.http.get(url).send().await?;
        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FeedError::RateLimited {
                    source_name: self.name().to_string(),
                    retry_after: retry_after(resp.headers()),
                })
            }
            StatusCode::NOT_FOUND => return Err(FeedError::UnknownGame(game_id.to_string())),
            s if !s.is_success() => {
                return Err(FeedError::Unavailable(format!("projection service error: {}", s)))
            }
            _ => {}
        }

        let raw: serde_json::Value = resp.json().await?;
        parse_projections(raw)
    }
}

/// Accepts either a bare list or `{ "projections": [...] }`.
fn parse_projections(raw: serde_json::Value) -> Result<Vec<ModelProjection>, FeedError> {
    let list = match raw {
        list @ serde_json::Value::Array(_) => list,
        serde_json::Value::Object(mut map) => map
            .remove("projections")
            .ok_or_else(|| FeedError::Malformed("missing projections field".into()))?,
        _ => return Err(FeedError::Malformed("projections payload is not a list".into())),
    };
    serde_json::from_value(list).map_err(|e| FeedError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_odds() -> serde_json::Value {
        serde_json::json!({
            "id": "e912304de2b2ce35b473ce2ecd3d1502",
            "sport_key": "basketball_nba",
            "bookmakers": [
                {
                    "key": "fanduel",
                    "title": "FanDuel",
                    "markets": [{
                        "key": "player_points",
                        "outcomes": [
                            { "name": "Over", "description": "Jayson Tatum", "price": 1.87, "point": 27.5 },
                            { "name": "Under", "description": "Jayson Tatum", "price": 1.95, "point": 27.5 },
                            { "name": "Over", "description": "Jimmy Butler", "price": 1.9, "point": 21.5 }
                        ]
                    }]
                },
                {
                    "key": "draftkings",
                    "title": "DraftKings",
                    "markets": [{
                        "key": "player_points",
                        "outcomes": [
                            { "name": "Over", "description": "Jayson Tatum", "price": "1.91", "point": "27.5" },
                            { "name": "Under", "description": "Jayson Tatum", "price": "1.91", "point": "27.5" }
                        ]
                    }]
                }
            ]
        })
    }

    #[test]
    fn test_parse_event_odds_pairs_sides() {
        let lines = parse_event_odds(&sample_odds()).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.player_id == "jayson-tatum"));
        let fd = lines.iter().find(|l| l.bookmaker == "fanduel").unwrap();
        assert_eq!(fd.line, 27.5);
        assert_eq!(fd.over, 1.87);
        assert_eq!(fd.under, 1.95);
        assert_eq!(fd.market, "player_points");
    }

    #[test]
    fn test_parse_event_odds_without_bookmakers() {
        let raw = serde_json::json!({ "id": "x", "bookmakers": [] });
        assert!(parse_event_odds(&raw).unwrap().is_empty());
        let raw = serde_json::json!({ "id": "x" });
        assert!(parse_event_odds(&raw).unwrap().is_empty());
    }

    #[test]
    fn test_event_odds_url_encodes_game_id() {
        let client = OddsApiClient::new("https://api.the-odds-api.com/", "k").unwrap();
        let url = client.event_odds_url("abc/123").unwrap();
        assert!(url.path().starts_with("/v4/sports/basketball_nba/events/abc%2F123/odds"));
        let query = url.query().unwrap_or_default();
        assert!(query.contains("oddsFormat=decimal"));
        assert!(query.contains("markets=player_points%2Cplayer_rebounds"));
    }

    #[test]
    fn test_parse_projections_both_shapes() {
        let item = serde_json::json!({
            "playerId": "jayson-tatum",
            "playerName": "Jayson Tatum",
            "market": "player_points",
            "mean": 29.1,
            "stdDev": 6.2,
            "confidence": 0.7
        });
        let bare = parse_projections(serde_json::json!([item.clone()])).unwrap();
        let wrapped = parse_projections(serde_json::json!({ "projections": [item] })).unwrap();
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].std_dev, 6.2);
    }

    #[test]
    fn test_parse_projections_rejects_garbage() {
        assert!(matches!(
            parse_projections(serde_json::json!("nope")),
            Err(FeedError::Malformed(_))
        ));
    }
}
