use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct PlayerApiResponse {
    token: Option<String>,
}

/// Re-authenticates expired IPTV `play_token` query parameters by calling
/// the stream host's `player_api.php`, mirroring the source's
/// `IPTVAuthenticator`.
///
/// Only URLs carrying `mac`, `stream` and `type` query parameters are
/// eligible; any other URL is returned unchanged since there is nothing to
/// authenticate against.
pub struct TokenRefresher {
    client: Client,
}

impl TokenRefresher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches a fresh `play_token` and returns `url` with it substituted.
    ///
    /// On any failure (missing params, network error, malformed response,
    /// no `token` field) the original `url` is returned unchanged — a
    /// refresh failure should not itself abort the download, the caller's
    /// subsequent range request will simply fail again and be retried.
    pub async fn refresh(&self, url: &str) -> Result<String, EngineError> {
        let parsed = Url::parse(url).map_err(|_| EngineError::InvalidUrl(url.to_string()))?;
        let params = query_map(&parsed);

        let (Some(mac), Some(stream_id), Some(content_type)) = (
            find(&params, "mac"),
            find(&params, "stream"),
            find(&params, "type"),
        ) else {
            debug!(url, "missing mac/stream/type, skipping token refresh");
            return Ok(url.to_string());
        };

        let auth_url = format!(
            "{}://{}/player_api.php",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        );

        let response = self
            .client
            .post(&auth_url)
            .query(&[
                ("username", mac.as_str()),
                ("password", mac.as_str()),
                ("action", "get_link"),
                ("stream_id", stream_id.as_str()),
                ("type", content_type.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(url = auth_url, status = %r.status(), "token refresh rejected");
                return Ok(url.to_string());
            }
            Err(e) => {
                warn!(url = auth_url, error = %e, "token refresh request failed");
                return Ok(url.to_string());
            }
        };

        let body: PlayerApiResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "token refresh response was not valid json");
                return Ok(url.to_string());
            }
        };

        let Some(token) = body.token else {
            warn!("token refresh response carried no token field");
            return Ok(url.to_string());
        };

        Ok(set_query_param(&parsed, "play_token", &token))
    }
}

/// True when `url`'s query already carries a `play_token` parameter.
pub fn has_play_token(url: &str) -> bool {
    Url::parse(url)
        .map(|parsed| parsed.query_pairs().any(|(k, _)| k == "play_token"))
        .unwrap_or(false)
}

fn query_map(url: &Url) -> Vec<(String, String)> {
    url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
}

fn find(params: &[(String, String)], key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn set_query_param(url: &Url, key: &str, value: &str) -> String {
    let mut pairs: Vec<(String, String)> =
        url.query_pairs().filter(|(k, _)| k != key).map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    pairs.push((key.to_string(), value.to_string()));

    let mut out = url.clone();
    out.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    out.into()
}
