// GitHub API integration for raising pull requests

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::PrSummary;

/// GitHub Pull Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u32,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub html_url: String,
    pub head_branch: String,
    pub base_branch: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<PullRequest> for PrSummary {
    fn from(pr: PullRequest) -> Self {
        PrSummary {
            number: pr.number,
            url: pr.html_url,
            branch: pr.head_branch,
            title: pr.title,
        }
    }
}

/// PR creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

/// GitHub API client
pub struct GitHubClient {
    token: String,
    owner: String,
    repo: String,
}

impl GitHubClient {
    /// Create a new GitHub client
    pub fn new(token: String, owner: String, repo: String) -> Self {
        Self { token, owner, repo }
    }

    /// Create a pull request
    pub async fn create_pull_request(
        &self,
        request: CreatePrRequest,
    ) -> Result<PullRequest, String> {
        let client = reqwest::Client::new();
        let url = format!(
            "https://api.github.com/repos/{}/{}/pulls",
            self.owner, self.repo
        );

        let body = json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
            "draft": request.draft,
        });

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "ralph-engine")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Failed to create PR: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("GitHub API error ({}): {}", status, text));
        }

        let pr_data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse response: {}", e))?;

        Ok(parse_pull_request(&pr_data))
    }
}

fn parse_pull_request(pr_data: &serde_json::Value) -> PullRequest {
    PullRequest {
        number: pr_data["number"].as_u64().unwrap_or(0) as u32,
        title: pr_data["title"].as_str().unwrap_or("").to_string(),
        body: pr_data["body"].as_str().map(|s| s.to_string()),
        state: pr_data["state"].as_str().unwrap_or("").to_string(),
        html_url: pr_data["html_url"].as_str().unwrap_or("").to_string(),
        head_branch: pr_data["head"]["ref"].as_str().unwrap_or("").to_string(),
        base_branch: pr_data["base"]["ref"].as_str().unwrap_or("").to_string(),
        created_at: pr_data["created_at"].as_str().unwrap_or("").to_string(),
        updated_at: pr_data["updated_at"].as_str().unwrap_or("").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_github_client() {
        let client = GitHubClient::new(
            "test_token".to_string(),
            "owner".to_string(),
            "repo".to_string(),
        );

        assert_eq!(client.token, "test_token");
        assert_eq!(client.owner, "owner");
        assert_eq!(client.repo, "repo");
    }

    #[test]
    fn test_parse_pull_request() {
        let data = serde_json::json!({
            "number": 42,
            "title": "Add parser",
            "body": "Implements the parser task",
            "state": "open",
            "html_url": "https://github.com/owner/repo/pull/42",
            "head": {"ref": "task/parser"},
            "base": {"ref": "main"},
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });

        let pr = parse_pull_request(&data);
        assert_eq!(pr.number, 42);
        assert_eq!(pr.head_branch, "task/parser");
        assert_eq!(pr.base_branch, "main");
        assert_eq!(pr.html_url, "https://github.com/owner/repo/pull/42");
    }

    #[test]
    fn test_pull_request_to_summary() {
        let pr = PullRequest {
            number: 7,
            title: "Fix flaky test".to_string(),
            body: None,
            state: "open".to_string(),
            html_url: "https://github.com/o/r/pull/7".to_string(),
            head_branch: "task/fix".to_string(),
            base_branch: "main".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };

        let summary: PrSummary = pr.into();
        assert_eq!(summary.number, 7);
        assert_eq!(summary.branch, "task/fix");
        assert_eq!(summary.title, "Fix flaky test");
    }

    // Note: Actual API tests would require a real GitHub token and repository
}
