//! robots.txt etiquette for page fetches.
//!
//! Rules from groups naming our agent are combined with the `*` group; the
//! longest matching path wins and `Allow` wins ties. A robots.txt that
//! cannot be fetched allows everything.

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::http::HttpClient;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PathRule {
    allow: bool,
    path: String,
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<PathRule>,
}

/// Parsed robots.txt.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<Group>,
}

impl RobotsRules {
    pub fn parse(body: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        // Consecutive User-agent lines share one group.
        let mut collecting_agents = false;

        for raw in body.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if !collecting_agents {
                        groups.push(Group::default());
                        collecting_agents = true;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    if let Some(group) = groups.last_mut() {
                        group.rules.push(PathRule {
                            allow: directive == "allow",
                            path: value.to_string(),
                        });
                    }
                }
                _ => collecting_agents = false,
            }
        }

        Self { groups }
    }

    /// Whether `user_agent` may fetch `path`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .trim()
            .to_ascii_lowercase();

        let best = self
            .groups
            .iter()
            .filter(|g| {
                g.agents
                    .iter()
                    .any(|a| a == "*" || (!a.is_empty() && token.contains(a.as_str())))
            })
            .flat_map(|g| &g.rules)
            .filter(|r| path_matches(&r.path, path))
            .max_by_key(|r| (r.path.len(), r.allow));

        best.is_none_or(|r| r.allow)
    }
}

/// Prefix match with `*` wildcards and an optional `$` end anchor. An empty
/// pattern matches nothing.
fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    if !body.contains('*') && !anchored {
        return path.starts_with(body);
    }
    let mut re = String::from("^");
    re.push_str(
        &body
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*"),
    );
    if anchored {
        re.push('$');
    }
    Regex::new(&re).is_ok_and(|r| r.is_match(path))
}

/// Fetch `{origin}/robots.txt` and check `url` against it.
pub async fn is_allowed(http: &HttpClient, url: &Url) -> bool {
    let Ok(robots_url) = url.join("/robots.txt") else {
        return true;
    };
    let body = match http.get_text(robots_url.as_str()).await {
        Ok(body) => body,
        Err(e) => {
            debug!(url = %robots_url, "robots.txt unavailable, allowing: {e}");
            return true;
        }
    };
    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    RobotsRules::parse(&body).is_allowed(http.user_agent(), &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROBOTS: &str = "\
# comment
User-agent: *
Disallow: /private/
Allow: /private/public-notices
Disallow: /*.pdf$

User-agent: BadBot
User-agent: lexwatch
Disallow: /consultations
";

    #[test]
    fn wildcard_group_applies_to_everyone() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(rules.is_allowed("other/1.0", "/guidance"));
        assert!(!rules.is_allowed("other/1.0", "/private/drafts"));
        assert!(rules.is_allowed("other/1.0", "/private/public-notices/2026"));
        assert!(!rules.is_allowed("other/1.0", "/files/act.pdf"));
        assert!(rules.is_allowed("other/1.0", "/files/act.pdf.html"));
    }

    #[test]
    fn named_group_combines_with_wildcard() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.is_allowed("lexwatch/0.1", "/consultations/open"));
        assert!(rules.is_allowed("other/1.0", "/consultations/open"));
        assert!(!rules.is_allowed("lexwatch/0.1", "/private/x"));
    }

    #[test]
    fn empty_disallow_allows_all() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n");
        assert!(rules.is_allowed("lexwatch", "/anything"));
    }

    #[test]
    fn no_robots_allows_all() {
        assert!(RobotsRules::default().is_allowed("lexwatch", "/"));
    }

    #[test]
    fn allow_wins_equal_length_tie() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /a\nAllow: /a\n");
        assert!(rules.is_allowed("lexwatch", "/a/b"));
    }

    #[tokio::test]
    async fn missing_robots_allows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let http = HttpClient::new("lexwatch/0.1").unwrap();
        let url = Url::parse(&format!("{}/private/x", server.uri())).unwrap();
        assert!(is_allowed(&http, &url).await);
    }

    #[tokio::test]
    async fn served_robots_is_enforced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ROBOTS))
            .mount(&server)
            .await;
        let http = HttpClient::new("lexwatch/0.1").unwrap();
        let blocked = Url::parse(&format!("{}/consultations/1", server.uri())).unwrap();
        let open = Url::parse(&format!("{}/guidance", server.uri())).unwrap();
        assert!(!is_allowed(&http, &blocked).await);
        assert!(is_allowed(&http, &open).await);
    }
}
