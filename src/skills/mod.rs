pub mod enrich;
pub mod rating;
pub mod review;
pub mod script;
pub mod wordplay;

use crate::types::ReviewIssue;

/// Reviewer objections appended to a regeneration request.
pub(crate) fn format_issues(issues: &[ReviewIssue]) -> String {
    let mut out = String::from("\n\n## 审核意见");
    for issue in issues {
        out.push_str(&format!("\n- {}: {}", issue.title, issue.problem));
    }
    out
}
