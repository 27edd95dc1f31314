use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Parsed robots.txt rules for a single host. A fetch failure is not an
/// error here — spec §4.2 step 4 says to cache a permissive policy and
/// proceed, so `RobotsChecker::fetch` never returns `Err`.
pub struct RobotsChecker {
    rules: HashMap<String, Vec<String>>,
}

impl RobotsChecker {
    /// Fetch and parse `https://{host}/robots.txt`. Any fetch or status
    /// error yields a permissive (allow-all) checker.
    pub async fn fetch(host: &str) -> Self {
        let url = format!("https://{host}/robots.txt");
        let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
            Ok(c) => c,
            Err(_) => return Self::permissive(),
        };

        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                Self::from_content(&body)
            }
            _ => Self::permissive(),
        }
    }

    pub fn permissive() -> Self {
        Self { rules: HashMap::new() }
    }

    /// Build a checker directly from robots.txt content (used by tests and
    /// by `fetch` once a body is in hand).
    pub fn from_content(content: &str) -> Self {
        Self { rules: Self::parse_robots_txt(content) }
    }

    /// Whether `url` is allowed for `user_agent`, consulting the single
    /// most specific matching group: the agent's own rules if it has one,
    /// otherwise the wildcard group. Never both — a specific group fully
    /// overrides the wildcard, matching `urllib.robotparser` semantics.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let path = match Url::parse(url) {
            Ok(u) => u.path().to_string(),
            Err(_) => return true,
        };

        let ua_lower = user_agent.to_lowercase();
        let group = self.rules.get(&ua_lower).or_else(|| self.rules.get("*"));

        let Some(disallowed) = group else {
            return true;
        };
        for pattern in disallowed {
            if pattern.is_empty() {
                continue;
            }
            if path.starts_with(pattern) {
                return false;
            }
        }

        true
    }

    fn parse_robots_txt(content: &str) -> HashMap<String, Vec<String>> {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line,
            };

            if line.is_empty() {
                current_agents.clear();
                continue;
            }

            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim();

                match key.as_str() {
                    "user-agent" => current_agents.push(value.to_lowercase()),
                    "disallow" => {
                        for agent in &current_agents {
                            rules.entry(agent.clone()).or_default().push(value.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ROBOTS: &str = r#"
User-agent: *
Disallow: /admin/
Disallow: /private/

User-agent: crawlhub-bot
Disallow: /
"#;

    #[test]
    fn wildcard_rules_block_matching_prefixes() {
        let checker = RobotsChecker::from_content(SAMPLE_ROBOTS);
        assert!(!checker.is_allowed("https://example.test/admin/page", "*"));
        assert!(!checker.is_allowed("https://example.test/private/data", "*"));
        assert!(checker.is_allowed("https://example.test/public", "*"));
    }

    #[test]
    fn specific_agent_rule_overrides_wildcard() {
        let checker = RobotsChecker::from_content(SAMPLE_ROBOTS);
        assert!(!checker.is_allowed("https://example.test/anything", "crawlhub-bot"));
    }

    #[test]
    fn empty_robots_allows_everything() {
        let checker = RobotsChecker::from_content("");
        assert!(checker.is_allowed("https://example.test/anything", "crawlhub-bot"));
    }

    #[test]
    fn explicit_allow_all_disallow_value_allows_everything() {
        let content = "User-agent: *\nDisallow:\n";
        let checker = RobotsChecker::from_content(content);
        assert!(checker.is_allowed("https://example.test/anything", "crawlhub-bot"));
    }

    #[test]
    fn permissive_checker_allows_everything() {
        let checker = RobotsChecker::permissive();
        assert!(checker.is_allowed("https://example.test/admin/", "crawlhub-bot"));
    }

    #[test]
    fn specific_agent_allow_all_is_not_shadowed_by_wildcard_disallow() {
        let content = "User-agent: *\nDisallow: /private/\n\nUser-agent: crawlhub-bot\nDisallow:\n";
        let checker = RobotsChecker::from_content(content);
        assert!(checker.is_allowed("https://example.test/private/data", "crawlhub-bot"));
        assert!(!checker.is_allowed("https://example.test/private/data", "other-bot"));
    }
}
