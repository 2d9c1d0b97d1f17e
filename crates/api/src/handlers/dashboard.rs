//! Read-only HTML summary of every queue, mounted under `/ui` when the
//! dashboard is enabled.

use std::fmt::Write;

use axum::extract::State;
use axum::response::Html;
use jobhost_queue::job::JobCounts;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

/// GET /ui and GET /ui/{*path}
///
/// Any sub-path renders the same page.
pub async fn overview(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Html<String>> {
    let mut rows = Vec::new();
    for queue in state.registry.list_queues()? {
        let counts = queue.get_job_counts().await?;
        rows.push((queue.qualified_name().to_string(), counts));
    }
    Ok(Html(render(&rows)))
}

const COLUMNS: [&str; 6] = ["waiting", "active", "delayed", "completed", "failed", "paused"];

fn render(rows: &[(String, JobCounts)]) -> String {
    let mut html = String::from(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>Queues</title></head>\n<body>\n<h1>Queues</h1>\n<table>\n<tr><th>queue</th>",
    );
    for column in COLUMNS {
        let _ = write!(html, "<th>{column}</th>");
    }
    html.push_str("</tr>\n");

    for (name, counts) in rows {
        let _ = write!(html, "<tr><td>{}</td>", escape(name));
        for value in [
            counts.waiting,
            counts.active,
            counts.delayed,
            counts.completed,
            counts.failed,
            counts.paused,
        ] {
            let _ = write!(html, "<td>{value}</td>");
        }
        html.push_str("</tr>\n");
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_row_per_queue() {
        let counts = JobCounts {
            waiting: 2,
            failed: 1,
            ..Default::default()
        };
        let html = render(&[("bull:example".into(), counts)]);

        let row = "<tr><td>bull:example</td>\
                   <td>2</td><td>0</td><td>0</td><td>0</td><td>1</td><td>0</td></tr>";
        assert!(html.contains(row), "unexpected page: {html}");
    }

    #[test]
    fn names_are_escaped() {
        assert_eq!(escape("<a&b>"), "&lt;a&amp;b&gt;");
    }
}
