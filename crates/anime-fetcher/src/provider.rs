//! Upstream presets.
//!
//! Each provider knows its URL templates, which rate limits apply and whether
//! its responses need payload inspection for soft bans.

use crate::api::rate_limiter::DEFAULT_BURST_WINDOW;
use crate::api::{ConfigError, RateLimiter, ResponseClassifier, SoftBanSentinel};
use clap::ValueEnum;
use shared::{Config, FetchConfig, RateLimitConfig};
use std::time::Duration;

/// Supported upstream APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Provider {
    /// Jikan (MyAnimeList unofficial API), keyed by MAL id
    Jikan,
    /// Shikimori, keyed by MAL id
    Shikimori,
    /// AniDB HTTP API, keyed by AniDB id
    Anidb,
    /// Anime365 series catalogue, walked by offset instead of by id
    Anime365,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Jikan => "jikan",
            Provider::Shikimori => "shikimori",
            Provider::Anidb => "anidb",
            Provider::Anime365 => "anime365",
        }
    }

    /// Catalogue upstreams are walked page by page and take no ids
    pub fn is_catalogue(&self) -> bool {
        matches!(self, Provider::Anime365)
    }

    /// Extension of stored response bodies
    pub fn extension(&self) -> &'static str {
        match self {
            Provider::Jikan | Provider::Shikimori | Provider::Anime365 => "json",
            Provider::Anidb => "xml",
        }
    }

    /// Endpoints fetched for every id. The first one is the primary record;
    /// when it fails the rest are skipped.
    pub fn endpoints(&self, config: &Config) -> Vec<Endpoint> {
        let providers = &config.providers;
        match self {
            Provider::Jikan => {
                let base = providers.jikan.base_url.trim_end_matches('/');
                vec![Endpoint::pages(
                    "episodes",
                    format!("{base}/anime/{{id}}/episodes?page={{page}}"),
                )]
            }
            Provider::Shikimori => {
                let base = providers.shikimori.base_url.trim_end_matches('/');
                let mut endpoints = vec![Endpoint::single("anime", format!("{base}/animes/{{id}}"))];
                for name in ["roles", "screenshots", "similar"] {
                    endpoints.push(Endpoint::single(
                        name,
                        format!("{base}/animes/{{id}}/{name}"),
                    ));
                }
                endpoints
            }
            Provider::Anidb => {
                let anidb = &providers.anidb;
                vec![Endpoint::single(
                    "anime",
                    format!(
                        "{}?request=anime&client={}&clientver={}&protover=1&aid={{id}}",
                        anidb.base_url, anidb.client, anidb.client_version
                    ),
                )]
            }
            Provider::Anime365 => {
                let anime365 = &providers.anime365;
                let base = anime365.base_url.trim_end_matches('/');
                vec![Endpoint::offsets(
                    "series",
                    format!(
                        "{base}/series/?limit={}&offset={{offset}}",
                        anime365.page_size
                    ),
                    anime365.start_offset,
                    anime365.page_size,
                )]
            }
        }
    }

    pub fn rate_limit<'a>(&self, config: &'a Config) -> &'a RateLimitConfig {
        match self {
            Provider::Jikan => &config.providers.jikan.rate_limit,
            Provider::Shikimori => &config.providers.shikimori.rate_limit,
            Provider::Anidb => &config.providers.anidb.rate_limit,
            Provider::Anime365 => &config.providers.anime365.rate_limit,
        }
    }

    /// Only AniDB hides bans inside regular-looking responses
    pub fn classifier(&self, fetch: &FetchConfig) -> Result<ResponseClassifier, ConfigError> {
        match self {
            Provider::Jikan | Provider::Shikimori | Provider::Anime365 => {
                Ok(ResponseClassifier::StatusOnly)
            }
            Provider::Anidb => Ok(ResponseClassifier::PayloadInspecting(SoftBanSentinel::anidb(
                Duration::from_secs(fetch.soft_ban_cooldown_secs),
            )?)),
        }
    }
}

/// Build the limiter for one upstream from its `[providers.*.rate_limit]` section
pub fn build_rate_limiter(limit: &RateLimitConfig) -> Result<RateLimiter, ConfigError> {
    let limiter = match limit.min_interval_ms {
        Some(ms) => RateLimiter::with_period(Duration::from_millis(ms), limit.requests_per_minute)?,
        None => RateLimiter::new(limit.requests_per_second, limit.requests_per_minute)?,
    };
    limiter.with_burst_window(DEFAULT_BURST_WINDOW, limit.window_mode)
}

/// How an endpoint is split across requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// One request per id
    Single,
    /// `{page}` counts up from 1 while `pagination.has_next_page` is set
    Pages,
    /// `{offset}` advances by `step` until a page comes back with empty `data`
    Offsets { start: u32, step: u32 },
}

/// URL template for one kind of request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    template: String,
    paging: Paging,
}

impl Endpoint {
    fn single(name: &'static str, template: String) -> Self {
        Self {
            name,
            template,
            paging: Paging::Single,
        }
    }

    fn pages(name: &'static str, template: String) -> Self {
        Self {
            name,
            template,
            paging: Paging::Pages,
        }
    }

    fn offsets(name: &'static str, template: String, start: u32, step: u32) -> Self {
        Self {
            name,
            template,
            paging: Paging::Offsets {
                start,
                step: step.max(1),
            },
        }
    }

    pub fn paging(&self) -> Paging {
        self.paging
    }

    /// Cursor of the first request: page 1 or the starting offset
    pub fn first_cursor(&self) -> u32 {
        match self.paging {
            Paging::Single | Paging::Pages => 1,
            Paging::Offsets { start, .. } => start,
        }
    }

    /// Cursor following `cursor`, or `None` once it would overflow
    pub fn next_cursor(&self, cursor: u32) -> Option<u32> {
        match self.paging {
            Paging::Single => None,
            Paging::Pages => cursor.checked_add(1),
            Paging::Offsets { step, .. } => cursor.checked_add(step),
        }
    }

    /// Fill in `{id}` and the cursor (`{page}` or `{offset}`)
    pub fn url(&self, id: u32, cursor: u32) -> String {
        let cursor = cursor.to_string();
        self.template
            .replace("{id}", &id.to_string())
            .replace("{page}", &cursor)
            .replace("{offset}", &cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::BurstWindowMode;

    #[test]
    fn test_jikan_episode_pages() {
        let config = Config::default();
        let endpoints = Provider::Jikan.endpoints(&config);

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].paging(), Paging::Pages);
        assert_eq!(endpoints[0].first_cursor(), 1);
        assert_eq!(endpoints[0].next_cursor(1), Some(2));
        assert_eq!(
            endpoints[0].url(5114, 2),
            "https://api.jikan.moe/v4/anime/5114/episodes?page=2"
        );
    }

    #[test]
    fn test_shikimori_endpoints() {
        let config = Config::default();
        let urls: Vec<String> = Provider::Shikimori
            .endpoints(&config)
            .iter()
            .map(|e| e.url(21, 1))
            .collect();

        assert_eq!(
            urls,
            vec![
                "https://shikimori.one/api/animes/21",
                "https://shikimori.one/api/animes/21/roles",
                "https://shikimori.one/api/animes/21/screenshots",
                "https://shikimori.one/api/animes/21/similar",
            ]
        );
    }

    #[test]
    fn test_anidb_url_carries_client() {
        let config = Config::default();
        let endpoint = &Provider::Anidb.endpoints(&config)[0];

        assert_eq!(endpoint.paging(), Paging::Single);
        assert_eq!(endpoint.next_cursor(1), None);
        assert_eq!(
            endpoint.url(69, 1),
            "http://api.anidb.net:9001/httpapi?request=anime&client=ichimetvos&clientver=2&protover=1&aid=69"
        );
    }

    #[test]
    fn test_anime365_walks_offsets() {
        let mut config = Config::default();
        config.providers.anime365.page_size = 100;
        config.providers.anime365.start_offset = 300;
        let endpoint = &Provider::Anime365.endpoints(&config)[0];

        assert!(Provider::Anime365.is_catalogue());
        assert!(!Provider::Jikan.is_catalogue());
        assert_eq!(endpoint.first_cursor(), 300);
        assert_eq!(endpoint.next_cursor(300), Some(400));
        assert_eq!(endpoint.next_cursor(u32::MAX - 10), None);
        assert_eq!(
            endpoint.url(0, 400),
            "https://smotret-anime.online/api/series/?limit=100&offset=400"
        );
    }

    #[test]
    fn test_classifier_selection() {
        let fetch = FetchConfig::default();
        assert!(matches!(
            Provider::Jikan.classifier(&fetch).unwrap(),
            ResponseClassifier::StatusOnly
        ));
        assert!(matches!(
            Provider::Anime365.classifier(&fetch).unwrap(),
            ResponseClassifier::StatusOnly
        ));
        match Provider::Anidb.classifier(&fetch).unwrap() {
            ResponseClassifier::PayloadInspecting(sentinel) => {
                assert_eq!(sentinel.cooldown(), Duration::from_secs(300));
            }
            other => panic!("unexpected classifier: {other:?}"),
        }
    }

    #[test]
    fn test_build_rate_limiter_prefers_interval() {
        let config = Config::default();

        let anidb = build_rate_limiter(Provider::Anidb.rate_limit(&config)).unwrap();
        assert_eq!(anidb.period(), Duration::from_secs(5));
        assert_eq!(anidb.burst_ceiling(), 12);

        let jikan = build_rate_limiter(Provider::Jikan.rate_limit(&config)).unwrap();
        assert_eq!(jikan.period(), Duration::from_secs(1) / 3);
        assert_eq!(jikan.burst_ceiling(), 60);
    }

    #[test]
    fn test_build_rate_limiter_rejects_huge_interval() {
        let limit = RateLimitConfig {
            min_interval_ms: Some(u64::MAX),
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            build_rate_limiter(&limit).unwrap_err(),
            ConfigError::IntervalTooLong { .. }
        ));
    }

    #[test]
    fn test_build_rate_limiter_rejects_zero() {
        let limit = RateLimitConfig {
            requests_per_second: 0,
            requests_per_minute: 60,
            min_interval_ms: None,
            window_mode: BurstWindowMode::Sliding,
        };
        assert_eq!(
            build_rate_limiter(&limit).unwrap_err(),
            ConfigError::ZeroRequestsPerSecond
        );
    }
}
