use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::provider::GameStateSource;
use crate::db::models::{GameClock, GameSnapshot, GameStatus, TeamLine, REGULATION_PERIODS};
use crate::error::FeedError;

/// Game-state provider backed by TheSportsDB v1 API.
/// Docs: <https://www.thesportsdb.com/api.php>
pub struct TheSportsDB {
    http: Client,
    api_key: String,
    /// Base URL for overriding in tests
    base_url: String,
}

impl TheSportsDB {
    pub fn new(api_key: Option<&str>, base_url: Option<&str>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(TheSportsDB {
            http,
            // "3" is TheSportsDB's public free-tier key; replace with a paid key for higher limits
            api_key: api_key.unwrap_or("3").to_string(),
            base_url: base_url
                .unwrap_or("https://www.thesportsdb.com/api/v1/json")
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait]
impl GameStateSource for TheSportsDB {
    fn name(&self) -> &str {
        "TheSportsDB"
    }

    async fn fetch_snapshot(&self, game_id: &str) -> Result<GameSnapshot, FeedError> {
        let url = format!("{}/{}/lookupevent.php", self.base_url, self.api_key);
        debug!("Fetching game {} from {}", game_id, url);

        let resp = self
            .http
            .get(&url)
            .query(&[("id", game_id)])
            .send()
            .await?;

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FeedError::RateLimited {
                    source_name: self.name().to_string(),
                    retry_after: retry_after(resp.headers()),
                })
            }
            StatusCode::NOT_FOUND => return Err(FeedError::UnknownGame(game_id.to_string())),
            s if !s.is_success() => {
                return Err(FeedError::Unavailable(format!("TheSportsDB error: {}", s)))
            }
            _ => {}
        }

        let raw: serde_json::Value = resp.json().await?;
        parse_lookup_response(game_id, &raw)
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_lookup_response(game_id: &str, raw: &serde_json::Value) -> Result<GameSnapshot, FeedError> {
    let event = raw["events"]
        .as_array()
        .and_then(|events| {
            events
                .iter()
                .find(|ev| string_field(&ev["idEvent"]).as_deref() == Some(game_id))
        })
        .ok_or_else(|| FeedError::UnknownGame(game_id.to_string()))?;

    if let Some(sport) = event["strSport"].as_str() {
        if !sport.eq_ignore_ascii_case("basketball") {
            return Err(FeedError::UnknownGame(format!(
                "event {} is {}, not basketball",
                game_id, sport
            )));
        }
    }

    let home_name = event["strHomeTeam"]
        .as_str()
        .ok_or_else(|| FeedError::Malformed("missing strHomeTeam".into()))?;
    let away_name = event["strAwayTeam"]
        .as_str()
        .ok_or_else(|| FeedError::Malformed("missing strAwayTeam".into()))?;

    let status = event["strStatus"].as_str().unwrap_or("");
    let progress = event["strProgress"].as_str().unwrap_or("");
    let (status, clock) = parse_period_clock(status, progress);

    Ok(GameSnapshot {
        game_id: game_id.to_string(),
        home: TeamLine {
            team_id: string_field(&event["idHomeTeam"]).unwrap_or_else(|| slugify(home_name)),
            name: home_name.to_string(),
            score: score_field(&event["intHomeScore"]),
        },
        away: TeamLine {
            team_id: string_field(&event["idAwayTeam"]).unwrap_or_else(|| slugify(away_name)),
            name: away_name.to_string(),
            score: score_field(&event["intAwayScore"]),
        },
        clock,
        status,
        timestamp: Utc::now(),
    })
}

fn string_field(v: &serde_json::Value) -> Option<String> {
    v.as_str()
        .map(|s| s.to_string())
        .or_else(|| v.as_u64().map(|n| n.to_string()))
}

fn score_field(v: &serde_json::Value) -> u32 {
    v.as_str()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| v.as_u64().and_then(|n| u32::try_from(n).ok()))
        .unwrap_or(0)
}

/// "Boston Celtics" → "boston-celtics"
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Overtime markers beyond this are treated as this many overtimes.
const MAX_OVERTIMES: u32 = 10;

/// Parse a basketball period marker plus an optional clock into status and
/// game clock.
///
/// Accepts "Q1".."Q4", "1Q", "OT", "OT2", "HT", "FT", "Final", "NS", and a clock
/// either in the same string ("Q3 5:42") or separately ("5:42", "05:42", "42").
pub fn parse_period_clock(period: &str, clock: &str) -> (GameStatus, GameClock) {
    let mut tokens = period.split_whitespace();
    let marker = tokens.next().unwrap_or("").to_lowercase();
    let inline_clock = tokens.next();

    let (status, period_no) = match marker.as_str() {
        "" | "ns" | "not" | "scheduled" | "pregame" => (GameStatus::Scheduled, 1),
        "ht" | "half" | "halftime" => (GameStatus::Halftime, 2),
        "ft" | "final" | "finished" | "aot" | "ended" | "match" | "after" => {
            return (GameStatus::Final, GameClock::new(REGULATION_PERIODS, 0));
        }
        m if m.starts_with("ot") => {
            let n = m[2..].parse::<u32>().unwrap_or(1).clamp(1, MAX_OVERTIMES);
            (GameStatus::InProgress, REGULATION_PERIODS + n)
        }
        m => match parse_quarter(m) {
            Some(q) => (GameStatus::InProgress, q),
            None => (GameStatus::InProgress, 1),
        },
    };

    let length = GameClock::period_length(period_no);
    let seconds_remaining = match status {
        GameStatus::Scheduled => length,
        GameStatus::Halftime => 0,
        _ => inline_clock
            .or(Some(clock).filter(|c| !c.trim().is_empty()))
            .and_then(parse_clock)
            .map(|s| s.min(length))
            .unwrap_or(length),
    };

    (status, GameClock::new(period_no, seconds_remaining))
}

/// "q3" / "3q" / "3rd" → 3
fn parse_quarter(marker: &str) -> Option<u32> {
    let digits: String = marker.chars().filter(|c| c.is_ascii_digit()).collect();
    let q = digits.parse::<u32>().ok()?;
    (1..=REGULATION_PERIODS).contains(&q).then_some(q)
}

/// "5:42" → 342, "42" → 2520 (whole minutes), "0:07.3" → 7
fn parse_clock(clock: &str) -> Option<u32> {
    let clock = clock.trim().trim_end_matches('\'');
    if let Some((m, s)) = clock.split_once(':') {
        let minutes = m.trim().parse::<u32>().ok()?;
        let seconds = s.trim().split('.').next()?.parse::<u32>().ok()?;
        return minutes.checked_mul(60)?.checked_add(seconds);
    }
    clock.parse::<u32>().ok()?.checked_mul(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_clock_quarters() {
        assert_eq!(
            parse_period_clock("Q3 5:42", ""),
            (GameStatus::InProgress, GameClock::new(3, 342))
        );
        assert_eq!(
            parse_period_clock("Q1", "11:05"),
            (GameStatus::InProgress, GameClock::new(1, 665))
        );
        assert_eq!(
            parse_period_clock("4Q", "0:07.3"),
            (GameStatus::InProgress, GameClock::new(4, 7))
        );
    }

    #[test]
    fn test_parse_period_clock_overtime() {
        assert_eq!(
            parse_period_clock("OT", "2:10"),
            (GameStatus::InProgress, GameClock::new(5, 130))
        );
        assert_eq!(
            parse_period_clock("OT2 4:00", ""),
            (GameStatus::InProgress, GameClock::new(6, 240))
        );
    }

    #[test]
    fn test_parse_period_clock_breaks() {
        assert_eq!(
            parse_period_clock("HT", ""),
            (GameStatus::Halftime, GameClock::new(2, 0))
        );
        assert_eq!(parse_period_clock("FT", "").0, GameStatus::Final);
        assert_eq!(parse_period_clock("Final", "").0, GameStatus::Final);
        assert_eq!(parse_period_clock("Match Finished", "").0, GameStatus::Final);
        assert_eq!(
            parse_period_clock("NS", ""),
            (GameStatus::Scheduled, GameClock::new(1, 720))
        );
    }

    #[test]
    fn test_clock_clamped_to_period_length() {
        assert_eq!(parse_period_clock("Q2", "15:00").1, GameClock::new(2, 720));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Boston Celtics"), "boston-celtics");
        assert_eq!(slugify("  LA  Clippers "), "la-clippers");
    }

    #[test]
    fn test_parse_lookup_response() {
        let raw = serde_json::json!({
            "events": [{
                "idEvent": "2052711",
                "strSport": "Basketball",
                "strHomeTeam": "Boston Celtics",
                "strAwayTeam": "Miami Heat",
                "idHomeTeam": "134860",
                "idAwayTeam": "134882",
                "intHomeScore": "88",
                "intAwayScore": 84,
                "strStatus": "Q4",
                "strProgress": "6:12"
            }]
        });
        let snap = parse_lookup_response("2052711", &raw).unwrap();
        assert_eq!(snap.home.score, 88);
        assert_eq!(snap.away.score, 84);
        assert_eq!(snap.home.team_id, "134860");
        assert_eq!(snap.clock, GameClock::new(4, 372));
        assert_eq!(snap.status, GameStatus::InProgress);
    }

    #[test]
    fn test_lookup_without_events_is_unknown_game() {
        let raw = serde_json::json!({ "events": null });
        assert!(matches!(
            parse_lookup_response("1", &raw),
            Err(FeedError::UnknownGame(_))
        ));
    }

    #[test]
    fn test_lookup_rejects_other_sports() {
        let raw = serde_json::json!({
            "events": [{
                "idEvent": "1",
                "strSport": "Soccer",
                "strHomeTeam": "Arsenal",
                "strAwayTeam": "Chelsea"
            }]
        });
        assert!(matches!(
            parse_lookup_response("1", &raw),
            Err(FeedError::UnknownGame(_))
        ));
    }

    #[test]
    fn test_lookup_ignores_other_events() {
        let raw = serde_json::json!({
            "events": [{
                "idEvent": "2052799",
                "strSport": "Basketball",
                "strHomeTeam": "Boston Celtics",
                "strAwayTeam": "Miami Heat",
                "intHomeScore": "88",
                "intAwayScore": "80"
            }]
        });
        assert!(matches!(
            parse_lookup_response("2052711", &raw),
            Err(FeedError::UnknownGame(_))
        ));
    }

    #[test]
    fn test_huge_clock_and_scores_do_not_overflow() {
        assert_eq!(parse_clock("99999999:00"), None);
        assert_eq!(parse_clock("4294967295"), None);
        let (_, clock) = parse_period_clock("Q2", "99999999:00");
        assert_eq!(clock, GameClock::new(2, 720));
        let (_, clock) = parse_period_clock("OT4294967295", "");
        assert_eq!(clock.period, REGULATION_PERIODS + MAX_OVERTIMES);
        assert_eq!(score_field(&serde_json::json!(5_000_000_000u64)), 0);
    }
}
