//! Directory API client.
//!
//! Talks to the hosted-domain admin directory over REST, with
//! transparent pagination and the retry policy the API demands:
//! exponential backoff on rate limits, a single forced token refresh on
//! expired credentials.

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::{Config, DirectoryConfig};

use super::types::{GroupInfo, GroupsPage};

/// Cap on rate-limit retries for a single request.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum DirectoryError {
  #[error("rate limited by the directory API")]
  RateLimited,
  #[error("directory credentials expired")]
  AuthExpired,
  #[error("no such directory object")]
  NotFound,
  #[error("directory request failed: {0}")]
  Other(String),
}

/// The remote group directory, as the rest of memberd sees it.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
  /// Every group on the domain.
  async fn list_groups(&self, domain: &str) -> Result<Vec<GroupInfo>, DirectoryError>;

  /// Parent groups that directly contain `email`. Empty if the address
  /// has no memberships or no longer exists.
  async fn list_memberships(&self, email: &str) -> Result<Vec<GroupInfo>, DirectoryError>;
}

/// Supplier of bearer tokens for the directory API.
#[async_trait]
pub trait TokenSource: Send + Sync {
  /// Current token. `force_refresh` demands a fresh one even if a
  /// cached token hasn't expired yet.
  async fn token(&self, force_refresh: bool) -> Result<String, DirectoryError>;
}

/// Token source that reads the API token from the environment.
pub struct EnvTokenSource;

#[async_trait]
impl TokenSource for EnvTokenSource {
  async fn token(&self, _force_refresh: bool) -> Result<String, DirectoryError> {
    Config::get_api_token().map_err(|e| DirectoryError::Other(format!("{:#}", e)))
  }
}

/// HTTP implementation of [`DirectoryClient`].
pub struct HttpDirectoryClient {
  http: reqwest::Client,
  api_base: Url,
  domain: String,
  tokens: Box<dyn TokenSource>,
}

impl HttpDirectoryClient {
  pub fn new(
    config: &DirectoryConfig,
    tokens: impl TokenSource + 'static,
  ) -> color_eyre::Result<Self> {
    let api_base = Url::parse(config.api_base.trim_end_matches('/'))
      .map_err(|e| color_eyre::eyre::eyre!("Invalid directory API base URL: {}", e))?;

    Ok(Self {
      http: reqwest::Client::new(),
      api_base,
      domain: config.domain.clone(),
      tokens: Box::new(tokens),
    })
  }

  /// Fetch one page of `GET {api_base}/groups` with the given query,
  /// applying the retry policy.
  async fn fetch_page(&self, query: &[(String, String)]) -> Result<GroupsPage, DirectoryError> {
    let mut url = Url::parse(&format!("{}/groups", self.api_base))
      .map_err(|e| DirectoryError::Other(format!("building request URL: {}", e)))?;
    url
      .query_pairs_mut()
      .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut rate_limit = 0u32;
    let mut refreshed = false;
    loop {
      let token = self.tokens.token(false).await?;

      let response = self
        .http
        .get(url.clone())
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| DirectoryError::Other(format!("request failed: {}", e)))?;

      let status = response.status();
      if status.is_success() {
        return response
          .json::<GroupsPage>()
          .await
          .map_err(|e| DirectoryError::Other(format!("decoding response: {}", e)));
      }

      let body = response.text().await.unwrap_or_default();
      match classify_status(status, &body) {
        DirectoryError::RateLimited if rate_limit < MAX_RATE_LIMIT_RETRIES => {
          // Just hit the rate limit; cool off before retrying
          rate_limit += 1;
          let delay = backoff_delay(rate_limit);
          tracing::info!(
            attempt = rate_limit,
            delay_secs = delay.as_secs_f64(),
            "Hit directory rate limit; backing off"
          );
          tokio::time::sleep(delay).await;
        }
        DirectoryError::AuthExpired if !refreshed => {
          // Give ourselves one chance to refresh the credentials
          refreshed = true;
          tracing::info!("Directory credentials expired; forcing a token refresh");
          self.tokens.token(true).await?;
        }
        err => return Err(err),
      }
    }
  }

  /// Fetch every page of a listing, following the continuation token.
  async fn fetch_all(
    &self,
    base_query: Vec<(String, String)>,
  ) -> Result<Vec<GroupInfo>, DirectoryError> {
    let mut groups = Vec::new();
    let mut page_token: Option<String> = None;
    let mut page = 0u32;

    loop {
      let mut query = base_query.clone();
      if let Some(token) = &page_token {
        query.push(("pageToken".to_string(), token.clone()));
      }

      tracing::debug!(page, "Requesting group listing page");
      let result = self.fetch_page(&query).await?;
      groups.extend(result.groups);

      match result.next_page_token {
        Some(token) => {
          page_token = Some(token);
          page += 1;
        }
        None => break,
      }
    }

    Ok(groups)
  }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
  async fn list_groups(&self, domain: &str) -> Result<Vec<GroupInfo>, DirectoryError> {
    self
      .fetch_all(vec![("domain".to_string(), domain.to_string())])
      .await
  }

  async fn list_memberships(&self, email: &str) -> Result<Vec<GroupInfo>, DirectoryError> {
    let result = self
      .fetch_all(vec![
        ("domain".to_string(), self.domain.clone()),
        ("userKey".to_string(), email.to_string()),
      ])
      .await;

    match result {
      Ok(groups) => Ok(domain_groups(groups, &self.domain)),
      // The address is gone; callers treat that as "no memberships"
      Err(DirectoryError::NotFound) => Ok(Vec::new()),
      Err(e) => Err(e),
    }
  }
}

/// Keep only groups on our own domain. The listing can include groups
/// from other domains the address happens to belong to.
pub(crate) fn domain_groups(groups: Vec<GroupInfo>, domain: &str) -> Vec<GroupInfo> {
  let suffix = format!("@{}", domain);
  groups
    .into_iter()
    .filter(|g| g.email.ends_with(&suffix))
    .collect()
}

/// Map an error response onto the retryability taxonomy.
fn classify_status(status: StatusCode, body: &str) -> DirectoryError {
  if status == StatusCode::TOO_MANY_REQUESTS
    || (status == StatusCode::FORBIDDEN
      && (body.contains("rateLimitExceeded")
        || body.contains("Request rate higher than configured")))
  {
    DirectoryError::RateLimited
  } else if status == StatusCode::UNAUTHORIZED
    || (status == StatusCode::FORBIDDEN && body.contains("Invalid Credentials"))
  {
    DirectoryError::AuthExpired
  } else if status == StatusCode::NOT_FOUND {
    DirectoryError::NotFound
  } else {
    let detail: String = body.chars().take(200).collect();
    DirectoryError::Other(format!("directory API returned {}: {}", status, detail))
  }
}

/// Exponential backoff with jitter: 2^attempt seconds plus up to 3
/// seconds of random slack.
fn backoff_delay(attempt: u32) -> Duration {
  let jitter: f64 = rand::thread_rng().gen_range(0.0..3.0);
  Duration::from_secs_f64(f64::from(2u32.pow(attempt)) + jitter)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn group(email: &str) -> GroupInfo {
    GroupInfo {
      email: email.to_string(),
      description: String::new(),
      direct_members_count: String::new(),
    }
  }

  #[test]
  fn test_classify_rate_limit() {
    assert!(matches!(
      classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
      DirectoryError::RateLimited
    ));
    assert!(matches!(
      classify_status(StatusCode::FORBIDDEN, r#"{"error": "rateLimitExceeded"}"#),
      DirectoryError::RateLimited
    ));
  }

  #[test]
  fn test_classify_auth_expired() {
    assert!(matches!(
      classify_status(StatusCode::UNAUTHORIZED, ""),
      DirectoryError::AuthExpired
    ));
    assert!(matches!(
      classify_status(StatusCode::FORBIDDEN, "Invalid Credentials"),
      DirectoryError::AuthExpired
    ));
  }

  #[test]
  fn test_classify_other() {
    assert!(matches!(
      classify_status(StatusCode::NOT_FOUND, ""),
      DirectoryError::NotFound
    ));
    assert!(matches!(
      classify_status(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
      DirectoryError::Other(_)
    ));
  }

  #[test]
  fn test_backoff_delay_bounds() {
    for attempt in 1..=5 {
      let delay = backoff_delay(attempt);
      let base = f64::from(2u32.pow(attempt));
      assert!(delay.as_secs_f64() >= base);
      assert!(delay.as_secs_f64() < base + 3.0);
    }
  }

  #[test]
  fn test_domain_groups_filters_foreign_domains() {
    let groups = vec![
      group("eng@example.com"),
      group("partners@other.org"),
      group("all@example.com"),
    ];

    let filtered = domain_groups(groups, "example.com");
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|g| g.email.ends_with("@example.com")));
  }
}
