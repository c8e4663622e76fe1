use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms,
                    error = %e,
                    "Retry attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(
                    delay_ms.saturating_mul(config.backoff_multiplier),
                    config.max_delay_ms,
                );
            }
        }
    }
}

/// Plain-text rendering of an HTML email body.
///
/// Block elements become line breaks, list items get a `* ` bullet, links keep
/// their target as `text [href]`, and `head`, `style` and `script` contents are
/// dropped. Whitespace is collapsed the way a browser would.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut links: Vec<Option<String>> = Vec::new();
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        push_text(&mut out, &rest[..open]);
        let after = &rest[open + 1..];

        if let Some(comment) = after.strip_prefix("!--") {
            rest = comment.find("-->").map_or("", |end| &comment[end + 3..]);
            continue;
        }

        let Some(close) = after.find('>') else {
            push_text(&mut out, &rest[open..]);
            rest = "";
            break;
        };

        let tag = &after[..close];
        rest = &after[close + 1..];

        let (closing, body) = match tag.strip_prefix('/') {
            Some(body) => (true, body),
            None => (false, tag),
        };
        let name = body
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match name.as_str() {
            "head" | "style" | "script" | "title" if !closing => {
                let end = format!("</{}", name);
                rest = rest
                    .to_ascii_lowercase()
                    .find(&end)
                    .map_or("", |i| &rest[i..]);
            }
            "br" => line_break(&mut out),
            "p" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "table" | "ul" | "ol"
            | "blockquote" => paragraph_break(&mut out),
            "div" | "tr" | "section" | "header" | "footer" => line_break(&mut out),
            "li" if !closing => {
                line_break(&mut out);
                out.push_str("* ");
            }
            "li" => line_break(&mut out),
            "hr" => {
                paragraph_break(&mut out);
                out.push_str("---");
                paragraph_break(&mut out);
            }
            "a" if !closing => links.push(attribute(body, "href")),
            "a" => {
                if let Some(Some(href)) = links.pop()
                    && !href.is_empty()
                    && !href.starts_with('#')
                {
                    out.push_str(" [");
                    out.push_str(&href);
                    out.push(']');
                }
            }
            "td" | "th" if closing => out.push(' '),
            _ => {}
        }
    }

    push_text(&mut out, rest);
    tidy(&out)
}

fn push_text(out: &mut String, raw: &str) {
    for c in decode_entities(raw).chars() {
        if c.is_whitespace() {
            if !(out.is_empty() || out.ends_with(' ') || out.ends_with('\n')) {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
}

fn line_break(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn paragraph_break(out: &mut String) {
    line_break(out);
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    raw.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{}=", name);
    // Only a whole attribute name counts, so `data-href=` is not `href=`.
    let start = lower
        .match_indices(&needle)
        .map(|(i, _)| i)
        .find(|&i| i == 0 || lower[..i].ends_with(char::is_whitespace))?
        + needle.len();
    let value = &tag[start..];

    let value = match value.chars().next()? {
        quote @ ('"' | '\'') => {
            let inner = &value[1..];
            &inner[..inner.find(quote).unwrap_or(inner.len())]
        }
        _ => value
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or_default(),
    };

    Some(decode_entities(value))
}

fn tidy(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut blank = false;

    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            if !blank && !lines.is_empty() {
                lines.push("");
            }
            blank = true;
        } else {
            lines.push(line);
            blank = false;
        }
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}
