use crate::view::ViewSnapshot;
use crate::{Message, ServiceError};
use chrono::Local;
use minijinja::{Environment, context};
use serde::Serialize;

const REFRESH_SECS: u32 = 2;

// Rendered with HTML auto-escaping, selected by the `.html` template name.
const PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{{ refresh }}">
<title>Discord Stream</title>
<style>
body { background: #111827; color: #f3f4f6; font-family: monospace; padding: 2rem; }
main { max-width: 56rem; margin: 0 auto; }
.status { color: #34d399; }
.message { display: flex; gap: 1rem; background: #1f2937; border: 1px solid #374151; border-radius: 4px; padding: 1rem; margin-bottom: 1rem; }
.avatar { width: 40px; height: 40px; border-radius: 50%; flex-shrink: 0; }
.initial { background: #6366f1; display: flex; align-items: center; justify-content: center; font-weight: bold; }
.body { flex: 1; min-width: 0; }
header { display: flex; justify-content: space-between; align-items: baseline; }
h3 { margin: 0; font-size: 0.875rem; color: #818cf8; }
time { font-size: 0.75rem; color: #6b7280; }
p { white-space: pre-wrap; overflow-wrap: break-word; color: #d1d5db; }
.empty { text-align: center; color: #6b7280; font-style: italic; padding: 5rem 0; }
</style>
</head>
<body>
<main>
<h1>Discord Stream</h1>
<p>System: <span class="status" data-status="{{ status }}">{{ label }}</span></p>
{% for card in cards -%}
<article class="message" id="message-{{ card.id }}">
{%- if card.avatar_url %}<img class="avatar" src="{{ card.avatar_url }}" alt="{{ card.author }}" width="40" height="40">
{%- else %}<div class="avatar initial">{{ card.initial }}</div>{% endif -%}
<div class="body"><header><h3>{{ card.author }}</h3><time datetime="{{ card.iso }}">{{ card.time }}</time></header><p>{{ card.content }}</p></div></article>
{% else -%}
<div class="empty">Waiting for signals...</div>
{% endfor -%}
</main>
</body>
</html>
"#;

#[derive(Serialize)]
struct Card<'a> {
    id: i64,
    author: &'a str,
    avatar_url: Option<&'a str>,
    initial: String,
    iso: String,
    time: String,
    content: &'a str,
}

impl<'a> From<&'a Message> for Card<'a> {
    fn from(message: &'a Message) -> Self {
        Card {
            id: message.id,
            author: &message.author_username,
            avatar_url: message.author_avatar_url.as_deref(),
            initial: initial(&message.author_username),
            iso: message.created_at.to_rfc3339(),
            time: message
                .created_at
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
            content: &message.content,
        }
    }
}

fn initial(name: &str) -> String {
    name.chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_else(|| "?".to_string())
}

/// Renders the whole page from a snapshot; output depends on nothing else
/// apart from the local timezone used for timestamps.
pub fn page(snapshot: &ViewSnapshot) -> Result<String, ServiceError> {
    let mut env = Environment::new();
    env.add_template("page.html", PAGE)?;

    let cards: Vec<Card> = snapshot.messages.iter().map(Card::from).collect();
    let html = env.get_template("page.html")?.render(context! {
        refresh => REFRESH_SECS,
        status => snapshot.status,
        label => snapshot.status.label(),
        cards => cards,
    })?;

    Ok(html)
}
