//! Branch resolution: decide which branch the agent works on.
//!
//! Resolution only reads from the hosting API; the checkout itself happens
//! afterwards through [`crate::io::git::Workspace`].

use tracing::{info, instrument, warn};

use crate::core::request::RunRequest;
use crate::core::slug::branch_name;
use crate::core::types::{BranchContext, Mode, PullRequest, RunMetadata};
use crate::error::PipelineError;
use crate::io::hosting::HostingApi;
use crate::io::token::Credential;

/// Resolved branch plus the pull request it came from (update mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub branch: BranchContext,
    pub pull_request: Option<PullRequest>,
}

#[instrument(skip_all, fields(mode = %request.mode))]
pub fn resolve_branch(
    request: &RunRequest,
    hosting: &dyn HostingApi,
    credential: &Credential,
    metadata: &RunMetadata,
) -> Result<Resolution, PipelineError> {
    match request.mode {
        Mode::Update => {
            let number = request.target_pr.ok_or_else(|| {
                PipelineError::Validation("pr_number is required for pr-update mode".to_string())
            })?;
            let pr = hosting
                .get_pull_request(credential, number)
                .map_err(PipelineError::Hosting)?
                .ok_or(PipelineError::BranchNotFound { number })?;

            let head_repo = match pr.head_repo.as_deref() {
                Some(repo) if repo != metadata.repository => Some(repo.to_string()),
                Some(_) => None,
                None => {
                    warn!(number, "head repository is gone, assuming same-repository branch");
                    None
                }
            };
            info!(
                number,
                head = %pr.head_ref,
                base = %pr.base_ref,
                fork = head_repo.is_some(),
                "resolved pull request branch"
            );
            Ok(Resolution {
                branch: BranchContext {
                    working_branch: pr.head_ref.clone(),
                    is_new_branch: false,
                    base_branch: pr.base_ref.clone(),
                    head_repo,
                },
                pull_request: Some(pr),
            })
        }
        Mode::Generate => {
            let name = branch_name(request.prompt_text(), &metadata.run_id);
            info!(branch = %name, base = %request.base_branch, "new branch for generated change");
            Ok(Resolution {
                branch: BranchContext {
                    working_branch: name,
                    is_new_branch: true,
                    base_branch: request.base_branch.clone(),
                    head_repo: None,
                },
                pull_request: None,
            })
        }
        Mode::Plan => Ok(Resolution {
            branch: BranchContext {
                working_branch: request.base_branch.clone(),
                is_new_branch: false,
                base_branch: request.base_branch.clone(),
                head_repo: None,
            },
            pull_request: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHosting;

    fn request(mode: Mode, prompt: Option<&str>, pr: Option<u64>) -> RunRequest {
        RunRequest {
            mode,
            prompt: prompt.map(str::to_string),
            target_pr: pr,
            base_branch: "main".to_string(),
            custom_instructions: None,
            callback: None,
        }
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: "777".to_string(),
            run_url: "https://github.com/o/r/actions/runs/777".to_string(),
            repository: "o/r".to_string(),
        }
    }

    fn credential() -> Credential {
        Credential::Fallback {
            token: "t".to_string(),
        }
    }

    #[test]
    fn update_uses_pull_request_head_and_base() {
        let hosting = FakeHosting::default().with_pull_request(FakeHosting::pr(
            42,
            "feature/cache",
            "develop",
            Some("o/r"),
        ));
        let resolved = resolve_branch(
            &request(Mode::Update, None, Some(42)),
            &hosting,
            &credential(),
            &metadata(),
        )
        .expect("resolve");
        assert_eq!(
            resolved.branch,
            BranchContext {
                working_branch: "feature/cache".to_string(),
                is_new_branch: false,
                base_branch: "develop".to_string(),
                head_repo: None,
            }
        );
        assert_eq!(resolved.pull_request.map(|p| p.number), Some(42));
    }

    #[test]
    fn update_detects_fork() {
        let hosting = FakeHosting::default().with_pull_request(FakeHosting::pr(
            9,
            "patch-1",
            "main",
            Some("someone/r"),
        ));
        let resolved = resolve_branch(
            &request(Mode::Update, None, Some(9)),
            &hosting,
            &credential(),
            &metadata(),
        )
        .expect("resolve");
        assert_eq!(resolved.branch.head_repo.as_deref(), Some("someone/r"));
    }

    #[test]
    fn missing_pull_request_is_branch_not_found() {
        let err = resolve_branch(
            &request(Mode::Update, None, Some(123)),
            &FakeHosting::default(),
            &credential(),
            &metadata(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::BranchNotFound { number: 123 }));
    }

    #[test]
    fn generate_creates_slugged_branch() {
        let resolved = resolve_branch(
            &request(Mode::Generate, Some("Add Redis caching!\nmore detail"), None),
            &FakeHosting::default(),
            &credential(),
            &metadata(),
        )
        .expect("resolve");
        assert_eq!(resolved.branch.working_branch, "devsy/add-redis-caching-777");
        assert!(resolved.branch.is_new_branch);
        assert_eq!(resolved.branch.base_branch, "main");
    }

    #[test]
    fn plan_stays_on_base() {
        let resolved = resolve_branch(
            &request(Mode::Plan, Some("plan"), None),
            &FakeHosting::default(),
            &credential(),
            &metadata(),
        )
        .expect("resolve");
        assert_eq!(resolved.branch.working_branch, "main");
        assert!(!resolved.branch.is_new_branch);
    }
}
