//! GitHub access through the `gh` CLI.
//!
//! Authentication, hosts and proxies are whatever `gh` is configured with.
//! Every call is one `gh` invocation returning JSON.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;

use crate::domain::{Issue, IssueSummary, PrReference, Publication};
use crate::error::{Result, ScryerError};
use crate::github::IssueSource;

const ISSUE_LIST_FIELDS: &str = "number,title,updatedAt,url,labels";
const ISSUE_VIEW_FIELDS: &str = "number,title,body,url,labels,updatedAt,state";

/// `gh` client settings
#[derive(Debug, Clone)]
pub struct GhConfig {
    /// `owner/name`; None lets gh infer it from `cwd`
    pub repo: Option<String>,

    /// Directory gh runs in
    pub cwd: PathBuf,

    pub comment_on_success: bool,
    pub list_limit: u32,
}

/// `gh`-backed issue source and PR publisher
#[derive(Debug, Clone)]
pub struct GhCli {
    config: GhConfig,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl GhIssue {
    fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    fn into_summary(self) -> IssueSummary {
        IssueSummary {
            number: self.number,
            labels: self.label_names(),
            title: self.title,
            url: self.url,
            updated_at: self.updated_at,
        }
    }

    fn into_issue(self) -> Issue {
        Issue {
            number: self.number,
            labels: self.label_names(),
            title: self.title,
            body: self.body,
            url: self.url,
            state: self.state.unwrap_or_else(|| "OPEN".to_string()),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    url: String,
}

/// Parse JSON output of a gh command.
fn parse_json<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| ScryerError::GitHub(format!("Invalid JSON from gh {}: {}", what, e)))
}

/// PR number from a pull request url.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    let rest = &url[url.find("/pull/")? + "/pull/".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Body of a created pull request.
pub fn pr_body(issue: &Issue, publication: &Publication) -> String {
    let mut body = format!(
        "Fixes #{}\n\n### What Changed\n- Automated implementation generated in a dedicated worktree.\n",
        issue.number
    );
    if !publication.diff_summary.trim().is_empty() {
        body.push_str(&format!("\n```\n{}\n```\n", publication.diff_summary.trim_end()));
    }
    body.push_str("\n### How To Verify\n- Review the PR diff and run project tests/linters.\n");
    body
}

/// Title of a created pull request.
pub fn pr_title(issue: &Issue) -> String {
    format!("[scryer] {}", issue.title.trim())
}

impl GhCli {
    pub fn new(config: GhConfig) -> Self {
        Self { config }
    }

    /// Run `gh <args>` and return stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut full: Vec<&str> = args.to_vec();
        if let Some(repo) = &self.config.repo {
            full.push("--repo");
            full.push(repo.as_str());
        }
        debug!("gh {}", full.join(" "));

        let output = Command::new("gh")
            .args(&full)
            .current_dir(&self.config.cwd)
            .env("GH_PROMPT_DISABLED", "1")
            .output()
            .await
            .map_err(|e| ScryerError::GitHub(format!("Failed to execute gh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScryerError::GitHub(format!(
                "gh {} failed ({}): {}",
                args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn open_pr_for_branch(&self, branch: &str) -> Result<Option<GhPullRequest>> {
        let raw = self
            .run(&["pr", "list", "--head", branch, "--state", "open", "--json", "number,url"])
            .await?;
        let prs: Vec<GhPullRequest> = parse_json("pr list", &raw)?;
        Ok(prs.into_iter().next())
    }
}

#[async_trait]
impl IssueSource for GhCli {
    async fn list_candidates(&self, label: &str) -> Result<Vec<IssueSummary>> {
        let query = format!("is:issue is:open label:\"{}\" sort:updated-desc", label);
        let limit = self.config.list_limit.to_string();
        let raw = self
            .run(&[
                "issue",
                "list",
                "--search",
                &query,
                "--limit",
                &limit,
                "--json",
                ISSUE_LIST_FIELDS,
            ])
            .await?;
        let issues: Vec<GhIssue> = parse_json("issue list", &raw)?;
        Ok(issues.into_iter().map(GhIssue::into_summary).collect())
    }

    async fn view_issue(&self, id: u64) -> Result<Issue> {
        let number = id.to_string();
        let raw = self
            .run(&["issue", "view", &number, "--json", ISSUE_VIEW_FIELDS])
            .await?;
        let issue: GhIssue = parse_json("issue view", &raw)?;
        Ok(issue.into_issue())
    }

    async fn publish_result(&self, issue: &Issue, publication: &Publication) -> Result<PrReference> {
        let branch = publication.branch.as_str();
        if let Some(existing) = self.open_pr_for_branch(branch).await? {
            info!("pr already open branch={} pr={}", branch, existing.url);
            return Ok(PrReference {
                number: Some(existing.number),
                url: existing.url,
                created: false,
            });
        }

        let title = pr_title(issue);
        let body = pr_body(issue, publication);
        let mut args = vec![
            "pr",
            "create",
            "--head",
            branch,
            "--base",
            publication.base_branch.as_str(),
            "--title",
            title.as_str(),
            "--body",
            body.as_str(),
        ];
        if publication.draft {
            args.push("--draft");
        }
        info!(
            "creating pr branch={} base={} draft={}",
            branch, publication.base_branch, publication.draft
        );
        let created = self.run(&args).await?;

        let reference = match self.open_pr_for_branch(branch).await? {
            Some(pr) => PrReference {
                number: Some(pr.number),
                url: pr.url,
                created: true,
            },
            None => {
                let url = created.trim().to_string();
                PrReference {
                    number: parse_pr_number(&url),
                    url,
                    created: true,
                }
            }
        };

        if self.config.comment_on_success {
            let number = issue.number.to_string();
            let comment = format!("Opened PR for this issue: {}", reference.url);
            self.run(&["issue", "comment", &number, "--body", &comment]).await?;
            info!("posted issue comment issue={} pr={}", issue.number, reference.url);
        }

        info!(
            "pr ready branch={} pr_number={:?} pr_url={}",
            branch, reference.number, reference.url
        );
        Ok(reference)
    }
}
