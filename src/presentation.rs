use dashmap::DashMap;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::include_res;
use crate::model::{CONSOLE_ID, ChatPost};

const FEED_CAPACITY: usize = 256;

const LINK_SCHEMES: &[&str] = &["http", "https", "mailto"];

/// Where newly accepted posts and toggles end up.
pub trait PresentationHandler: Send + Sync {
    fn handle(&self, post: &ChatPost);

    /// `None` turns the player's toggle off.
    fn toggle(&self, player_id: Uuid, level: Option<u8>);
}

/// Which level each player's plain chat is redirected to.
///
/// Entries live until toggled off or explicitly forgotten when the player
/// disconnects.
#[derive(Debug, Default)]
pub struct ToggleRegistry {
    levels: DashMap<Uuid, u8>,
}

impl ToggleRegistry {
    pub fn set(&self, player_id: Uuid, level: Option<u8>) {
        match level {
            Some(level) => {
                self.levels.insert(player_id, level);
            }
            None => {
                self.levels.remove(&player_id);
            }
        }
    }

    pub fn get(&self, player_id: Uuid) -> Option<u8> {
        self.levels.get(&player_id).map(|level| *level)
    }

    pub fn forget(&self, player_id: Uuid) {
        self.levels.remove(&player_id);
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Renders posts to HTML fragments and fans them out to feed subscribers.
pub struct FeedPresenter {
    format: String,
    markdown: bool,
    tx: broadcast::Sender<String>,
    toggles: ToggleRegistry,
}

impl FeedPresenter {
    pub fn new(format: &str, markdown: bool) -> Self {
        Self {
            format: format.to_owned(),
            markdown,
            tx: broadcast::channel(FEED_CAPACITY).0,
            toggles: ToggleRegistry::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn toggles(&self) -> &ToggleRegistry {
        &self.toggles
    }

    pub fn render(&self, post: &ChatPost) -> String {
        let player = if post.player_id == CONSOLE_ID {
            "CONSOLE".to_owned()
        } else {
            post.player_id.to_string()
        };
        let level = if post.level_name.is_empty() { post.level.to_string() } else { post.level_name.clone() };
        let message = if self.markdown { render_markdown(&post.message) } else { escape_html(&post.message) };

        let line = self
            .format
            .replace("{server}", &escape_html(&post.server_name))
            .replace("{level}", &escape_html(&level))
            .replace("{player}", &player)
            .replace("{message}", &message);

        include_res!(str, "/pages/post.html")
            .replace("{level}", &post.level.to_string())
            .replace("{server_id}", &post.server_id.to_string())
            .replace("{id}", &post.id.to_string())
            .replace("{date}", &post.date.to_string())
            .replace("{time}", &clock(post.date))
            .replace("{line}", &line)
    }
}

impl PresentationHandler for FeedPresenter {
    fn handle(&self, post: &ChatPost) {
        // no subscribers is fine
        let _ = self.tx.send(self.render(post));
    }

    fn toggle(&self, player_id: Uuid, level: Option<u8>) {
        self.toggles.set(player_id, level);
    }
}

/// Raw HTML comes out as text. Links and images pointing anywhere but
/// `LINK_SCHEMES` (or a relative target) lose their tag and keep their text.
fn render_markdown(message: &str) -> String {
    let mut kept = Vec::new();
    let parser = Parser::new(message).filter_map(move |event| match event {
        Event::Html(html) | Event::InlineHtml(html) => Some(Event::Text(html)),
        Event::Start(Tag::Link { ref dest_url, .. } | Tag::Image { ref dest_url, .. }) => {
            let safe = is_safe_url(dest_url);
            kept.push(safe);
            safe.then_some(event)
        }
        Event::End(TagEnd::Link | TagEnd::Image) => kept.pop().unwrap_or(true).then_some(event),
        _ => Some(event),
    });
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);

    let trimmed = html.trim_end();
    match trimmed.strip_prefix("<p>").and_then(|inner| inner.strip_suffix("</p>")) {
        Some(inner) if !inner.contains("<p>") => inner.to_owned(),
        _ => trimmed.to_owned(),
    }
}

fn is_safe_url(url: &str) -> bool {
    // browsers ignore whitespace and control characters inside a scheme
    let cleaned: String = url.chars().filter(|c| !c.is_ascii_whitespace() && !c.is_control()).collect();
    match cleaned.split_once(':') {
        Some((scheme, _)) if !scheme.contains(['/', '?', '#']) => {
            LINK_SCHEMES.iter().any(|allowed| scheme.eq_ignore_ascii_case(allowed))
        }
        _ => true,
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn clock(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|date| date.format(format_description!("[hour]:[minute]:[second]")).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(message: &str) -> ChatPost {
        ChatPost {
            id: 42,
            server_id: Uuid::new_v4(),
            server_name: "lobby".to_owned(),
            player_id: CONSOLE_ID,
            level: 1,
            level_name: "STAFF".to_owned(),
            message: message.to_owned(),
            date: 0,
        }
    }

    #[test]
    fn renders_format_fields() {
        let presenter = FeedPresenter::new("[{server}] [{level}] {player} >> {message}", false);
        let html = presenter.render(&post("hi"));
        assert!(html.contains("[lobby] [STAFF] CONSOLE >> hi"), "{html}");
        assert!(html.contains("00:00:00"));
        assert!(html.contains("level-1"));
    }

    #[test]
    fn markdown_is_rendered_and_html_escaped() {
        let presenter = FeedPresenter::new("{message}", true);
        let html = presenter.render(&post("**loud** <script>x</script>"));
        assert!(html.contains("<strong>loud</strong>"), "{html}");
        assert!(!html.contains("<script>"), "{html}");
    }

    #[test]
    fn script_links_lose_their_target() {
        let html = render_markdown("[x](javascript:alert(1)) ![pic](JavaScript:alert(2))");
        assert!(!html.to_ascii_lowercase().contains("script:"), "{html}");
        assert!(!html.contains("href") && !html.contains("<img"), "{html}");
        assert!(html.contains('x') && html.contains("pic"), "{html}");
        assert!(!render_markdown("<vbscript:run>").contains("href"));

        let html = render_markdown("[docs](https://example.com/help) [mail](mailto:staff@example.com) [rel](/levels)");
        assert!(html.contains(r#"<a href="https://example.com/help">docs</a>"#), "{html}");
        assert!(html.contains(r#"<a href="mailto:staff@example.com">mail</a>"#), "{html}");
        assert!(html.contains(r#"<a href="/levels">rel</a>"#), "{html}");
    }

    #[test]
    fn plain_messages_are_escaped() {
        let presenter = FeedPresenter::new("{message}", false);
        let html = presenter.render(&post("a < b"));
        assert!(html.contains("a &lt; b"));
    }

    #[tokio::test]
    async fn handle_broadcasts_to_subscribers() {
        let presenter = FeedPresenter::new("{message}", false);
        let mut rx = presenter.subscribe();
        presenter.handle(&post("ping"));
        assert!(rx.recv().await.unwrap().contains("ping"));
    }

    #[test]
    fn toggles_set_and_clear() {
        let presenter = FeedPresenter::new("{message}", false);
        let player = Uuid::new_v4();

        presenter.toggle(player, Some(3));
        assert_eq!(presenter.toggles().get(player), Some(3));
        presenter.toggle(player, None);
        assert_eq!(presenter.toggles().get(player), None);

        presenter.toggle(player, Some(2));
        presenter.toggles().forget(player);
        assert!(presenter.toggles().is_empty());
    }
}
