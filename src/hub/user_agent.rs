//! Request identity string sent with every hub request

/// Compose `name/version; rust; os/..; arch/..[; extra]` with duplicate
/// tokens removed
pub fn build_user_agent(name: &str, version: &str, extra: Option<&str>) -> String {
    let mut agent = format!(
        "{}/{}; rust; os/{}; arch/{}",
        name,
        version,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if let Some(extra) = extra {
        agent.push_str("; ");
        agent.push_str(extra);
    }
    dedupe_user_agent(&agent)
}

/// Drop repeated `;`-separated tokens, keeping the first occurrence
pub fn dedupe_user_agent(agent: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    agent
        .split(';')
        .map(str::trim)
        .filter(|token| !token.is_empty() && seen.insert(*token))
        .collect::<Vec<_>>()
        .join("; ")
}
