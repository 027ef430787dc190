//! GitHub REST client for the calls the pipeline makes.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{CreatedPullRequest, PrComment, PullRequest};
use crate::io::token::Credential;

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;

/// Login and numeric id of the account a token authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountIdentity {
    pub login: String,
    pub id: u64,
}

/// Fields for opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Hosting API operations used by branch resolution and post-agent actions.
pub trait HostingApi {
    /// `Ok(None)` when the pull request does not exist.
    fn get_pull_request(&self, credential: &Credential, number: u64)
    -> Result<Option<PullRequest>>;
    /// Committer date of the newest commit on the PR, `None` when it has none.
    fn last_commit_date(
        &self,
        credential: &Credential,
        number: u64,
    ) -> Result<Option<DateTime<Utc>>>;
    fn list_issue_comments(&self, credential: &Credential, number: u64) -> Result<Vec<PrComment>>;
    fn list_review_comments(&self, credential: &Credential, number: u64)
    -> Result<Vec<PrComment>>;
    fn create_pull_request(
        &self,
        credential: &Credential,
        request: &NewPullRequest,
    ) -> Result<CreatedPullRequest>;
    fn create_issue_comment(&self, credential: &Credential, number: u64, body: &str) -> Result<()>;
    fn authenticated_user(&self, credential: &Credential) -> Result<AccountIdentity>;
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: Client,
    api_url: String,
    repository: String,
}

#[derive(Debug, Deserialize)]
struct PullPayload {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    head: RefPayload,
    base: RefPayload,
}

#[derive(Debug, Deserialize)]
struct RefPayload {
    #[serde(rename = "ref")]
    name: String,
    repo: Option<RepoPayload>,
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    committer: Option<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    user: Option<UserPayload>,
    #[serde(default)]
    body: String,
    path: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CreatedPayload {
    number: u64,
    html_url: String,
}

impl From<PullPayload> for PullRequest {
    fn from(p: PullPayload) -> Self {
        PullRequest {
            number: p.number,
            title: p.title,
            body: p.body,
            head_ref: p.head.name,
            head_repo: p.head.repo.map(|r| r.full_name),
            base_ref: p.base.name,
            html_url: p.html_url,
        }
    }
}

impl From<CommentPayload> for PrComment {
    fn from(c: CommentPayload) -> Self {
        PrComment {
            author: c.user.map(|u| u.login).unwrap_or_else(|| "ghost".to_string()),
            body: c.body,
            path: c.path,
            created_at: c.created_at,
        }
    }
}

impl GithubClient {
    pub fn new(
        api_url: impl Into<String>,
        repository: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("devsy-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build hosting http client")?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}{path}", self.api_url, self.repository)
    }

    fn authed(&self, builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        builder
            .bearer_auth(credential.token())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn get_json<T: DeserializeOwned>(&self, credential: &Credential, url: &str) -> Result<T> {
        let response = self
            .authed(self.http.get(url), credential)
            .send()
            .with_context(|| format!("GET {url}"))?;
        let response = ensure_success(response, url)?;
        response.json().with_context(|| format!("decode {url}"))
    }

    fn get_paginated<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_url = format!("{url}?per_page={PER_PAGE}&page={page}");
            let batch: Vec<T> = self.get_json(credential, &page_url)?;
            let n = batch.len();
            items.extend(batch);
            if n < PER_PAGE {
                break;
            }
        }
        Ok(items)
    }
}

fn ensure_success(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!("{url} returned {status}: {}", body.trim());
}

impl HostingApi for GithubClient {
    #[instrument(skip_all, fields(repo = %self.repository, number = number))]
    fn get_pull_request(
        &self,
        credential: &Credential,
        number: u64,
    ) -> Result<Option<PullRequest>> {
        let url = self.repo_url(&format!("/pulls/{number}"));
        let response = self
            .authed(self.http.get(&url), credential)
            .send()
            .with_context(|| format!("GET {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("pull request not found");
            return Ok(None);
        }
        let payload: PullPayload = ensure_success(response, &url)?
            .json()
            .with_context(|| format!("decode {url}"))?;
        Ok(Some(payload.into()))
    }

    #[instrument(skip_all, fields(repo = %self.repository, number = number))]
    fn last_commit_date(
        &self,
        credential: &Credential,
        number: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let url = self.repo_url(&format!("/pulls/{number}/commits"));
        let commits: Vec<CommitPayload> = self.get_paginated(credential, &url)?;
        Ok(commits
            .last()
            .and_then(|c| c.commit.committer.as_ref())
            .map(|s| s.date))
    }

    #[instrument(skip_all, fields(repo = %self.repository, number = number))]
    fn list_issue_comments(&self, credential: &Credential, number: u64) -> Result<Vec<PrComment>> {
        let url = self.repo_url(&format!("/issues/{number}/comments"));
        let comments: Vec<CommentPayload> = self.get_paginated(credential, &url)?;
        Ok(comments
            .into_iter()
            .map(|c| PrComment {
                path: None,
                ..PrComment::from(c)
            })
            .collect())
    }

    #[instrument(skip_all, fields(repo = %self.repository, number = number))]
    fn list_review_comments(
        &self,
        credential: &Credential,
        number: u64,
    ) -> Result<Vec<PrComment>> {
        let url = self.repo_url(&format!("/pulls/{number}/comments"));
        let comments: Vec<CommentPayload> = self.get_paginated(credential, &url)?;
        Ok(comments.into_iter().map(PrComment::from).collect())
    }

    #[instrument(skip_all, fields(repo = %self.repository, head = %request.head))]
    fn create_pull_request(
        &self,
        credential: &Credential,
        request: &NewPullRequest,
    ) -> Result<CreatedPullRequest> {
        let url = self.repo_url("/pulls");
        let response = self
            .authed(self.http.post(&url), credential)
            .json(request)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let created: CreatedPayload = ensure_success(response, &url)?
            .json()
            .with_context(|| format!("decode {url}"))?;
        Ok(CreatedPullRequest {
            number: created.number,
            html_url: created.html_url,
        })
    }

    #[instrument(skip_all, fields(repo = %self.repository, number = number))]
    fn create_issue_comment(&self, credential: &Credential, number: u64, body: &str) -> Result<()> {
        let url = self.repo_url(&format!("/issues/{number}/comments"));
        let response = self
            .authed(self.http.post(&url), credential)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .with_context(|| format!("POST {url}"))?;
        ensure_success(response, &url)?;
        Ok(())
    }

    fn authenticated_user(&self, credential: &Credential) -> Result<AccountIdentity> {
        self.get_json(credential, &format!("{}/user", self.api_url))
    }
}

/// Merge conversation and review comments into creation order.
pub fn merged_comments(mut issue: Vec<PrComment>, review: Vec<PrComment>) -> Vec<PrComment> {
    issue.extend(review);
    issue.sort_by_key(|c| c.created_at);
    issue
}
