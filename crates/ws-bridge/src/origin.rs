use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginRejection {
    #[error("request carries no Origin header")]
    Missing,
    #[error("origin '{origin}' is not in the allowlist")]
    NotAllowed { origin: String },
}

/// Origins permitted to open gateway sessions.
///
/// An empty list disables the check. Otherwise the request's `Origin` must
/// equal one of the entries exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAllowlist {
    entries: Vec<String>,
}

impl OriginAllowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(Into::into)
                .map(|entry: String| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
        }
    }

    /// `true` when at least one entry is configured.
    pub fn is_enforced(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Check the `Origin` header of an upgrade request.
    pub fn check(&self, origin: Option<&str>) -> Result<(), OriginRejection> {
        if !self.is_enforced() {
            return Ok(());
        }

        let origin = origin.ok_or(OriginRejection::Missing)?;

        if self.entries.iter().any(|entry| entry == origin) {
            Ok(())
        } else {
            Err(OriginRejection::NotAllowed {
                origin: origin.to_string(),
            })
        }
    }
}
