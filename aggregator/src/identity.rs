use crate::config::IdentityConfig;
use http::HeaderMap;

/// The authenticated caller, as asserted by the front proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user: String,
    pub groups: Vec<String>,
}

impl CallerIdentity {
    /// Returns `None` when the user header is missing or empty. Group headers
    /// may repeat and may carry comma separated values.
    pub fn from_headers(headers: &HeaderMap, config: &IdentityConfig) -> Option<Self> {
        let user = headers
            .get(config.user_header.as_str())?
            .to_str()
            .ok()?
            .trim();
        if user.is_empty() {
            return None;
        }

        let groups = headers
            .get_all(config.group_header.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .map(str::to_string)
            .collect();

        Some(CallerIdentity {
            user: user.to_string(),
            groups,
        })
    }
}
