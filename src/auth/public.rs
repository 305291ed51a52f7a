// Public endpoint classification

/// Path fragments reachable without a credential
pub const DEFAULT_PUBLIC_FRAGMENTS: [&str; 7] = [
    "/auth/login",
    "/auth/register",
    "/auth/forgot-password",
    "/auth/verify-reset-otp",
    "/auth/reset-password",
    "/auth/refresh",
    "/locations",
];

/// Decides whether a request path must go out without an Authorization header
#[derive(Debug, Clone)]
pub struct PublicEndpointClassifier {
    fragments: Vec<String>,
}

impl Default for PublicEndpointClassifier {
    fn default() -> Self {
        Self::with_fragments(DEFAULT_PUBLIC_FRAGMENTS)
    }
}

impl PublicEndpointClassifier {
    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
        }
    }

    /// Substring match of `path` against the configured fragments
    pub fn is_public(&self, path: &str) -> bool {
        self.fragments
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }
}
